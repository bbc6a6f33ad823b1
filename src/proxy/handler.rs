use crate::error::{
    map_upstream_error, DispatchError, ERROR_CODE_INTERNAL, ERROR_CODE_PAYLOAD_TOO_LARGE,
};
use crate::plugin::Handler;
use crate::proxy::aggregate::{aggregate, AggregatedResponse};
use crate::proxy::context::{
    error_response, full_body, BoxBody, ClientAddr, InboundRequest, OutboundResponse,
    PluginContext, RequestId, RequestMetrics, REQUEST_ID_HEADER,
};
use crate::proxy::dispatch::dispatch;
use crate::routing::CompiledRoute;
use crate::server::GatewayState;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, StatusCode};
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Handle one inbound request end to end:
///
/// 1. resolve the request id (inbound `X-Request-ID` or minted)
/// 2. match `(method, path)` against the active route table
/// 3. observability shim (in-flight gauge, duration, status counter)
/// 4. middleware chain, outermost first
/// 5. request plugins → dispatch → aggregation → response plugins
/// 6. write-back with the request id echoed
pub async fn handle_request(
    req: Request<BoxBody>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Response<BoxBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let request_id = resolve_request_id(req.headers());

    let router = state.router.load_full();
    let Some(route) = router.match_route(&method, &path) else {
        debug!("proxy: no route matched, method={}, path={}", method, path);
        metrics::counter!(
            "gateway_failed_requests_total",
            "reason" => "no_matched_route",
        )
        .increment(1);
        let mut resp = Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(CONTENT_TYPE, "application/json")
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap();
        echo_request_id(&mut resp, &request_id);
        return resp;
    };

    let shim = RequestMetrics::start(&route.path, &method);
    let client_ip = resolve_client_ip(req.headers(), peer_addr);

    let mut req = req;
    req.extensions_mut().insert(RequestId(request_id.clone()));
    req.extensions_mut().insert(ClientAddr(client_ip));

    // Innermost handler: plugins + dispatch + aggregation. Middlewares wrap
    // it in declared order, first-declared outermost.
    let mut handler: Handler = {
        let route = route.clone();
        let request_id = request_id.clone();
        Box::new(move |req| Box::pin(run_pipeline(req, route, request_id)))
    };
    for middleware in route.middlewares.iter().rev() {
        handler = middleware.clone().wrap(handler);
    }

    let mut resp = handler(req).await;
    echo_request_id(&mut resp, &request_id);

    shim.record_status(resp.status());
    info!(
        client_ip = %client_ip,
        method = %method,
        path = %path,
        status = resp.status().as_u16(),
        route = %route.path,
        latency_ms = %shim.elapsed_ms(),
        "access"
    );

    resp
}

/// Request plugins → dispatch → aggregation → response plugins → write-back.
async fn run_pipeline(
    req: Request<BoxBody>,
    route: Arc<CompiledRoute>,
    request_id: String,
) -> Response<BoxBody> {
    let (parts, body) = req.into_parts();
    let mut ctx = PluginContext::new(
        InboundRequest {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
        },
        route.clone(),
        request_id.clone(),
    );

    // Request plugins run in declared order. They may mutate the request
    // view and the context bag but cannot short-circuit the chain.
    for plugin in &route.request_plugins {
        plugin.execute(&mut ctx);
    }

    let results = match dispatch(&route, &ctx.request, body).await {
        Ok(results) => results,
        Err(DispatchError::BodyTooLarge) => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                ERROR_CODE_PAYLOAD_TOO_LARGE,
                "payload too large",
                &request_id,
            )
        }
        Err(DispatchError::BodyRead(_)) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ERROR_CODE_INTERNAL,
                "internal error",
                &request_id,
            )
        }
    };

    let all_failed = !results.is_empty() && results.iter().all(|r| r.err.is_some());

    if route.aggregate.is_empty() {
        // No aggregation configured: the first upstream's response is the
        // client response.
        let Some(first) = results.first() else {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ERROR_CODE_INTERNAL,
                "internal error",
                &request_id,
            );
        };
        if let Some(err) = &first.err {
            let mapped = map_upstream_error(err);
            return error_response(StatusCode::BAD_GATEWAY, mapped.code, &mapped.message, &request_id);
        }
        ctx.response.status = StatusCode::from_u16(first.status).unwrap_or(StatusCode::OK);
        ctx.response.headers = first.headers.clone();
        ctx.response.body = first.body.clone().unwrap_or_default();
    } else {
        let aggregated = aggregate(&results, &route.aggregate, route.allow_partial_results);

        ctx.response.status = if all_failed {
            StatusCode::BAD_GATEWAY
        } else if aggregated.data.is_none() {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        };
        ctx.response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        ctx.response.body = if aggregated.errors.is_empty() {
            aggregated.data.clone().unwrap_or_default()
        } else {
            envelope_body(&aggregated, &request_id)
        };
    }

    for plugin in &route.response_plugins {
        plugin.execute(&mut ctx);
    }

    write_back(ctx.response)
}

/// Serialize the aggregation envelope `{data, errors, partial}` with the
/// request id stamped on each error. `data` is embedded as raw JSON so that
/// array-mode bodies stay byte-for-byte.
fn envelope_body(aggregated: &AggregatedResponse, request_id: &str) -> bytes::Bytes {
    let mut errors = aggregated.errors.clone();
    for err in &mut errors {
        err.request_id = Some(request_id.to_owned());
    }
    let errors_json = serde_json::to_string(&errors).unwrap_or_else(|_| "[]".to_owned());

    let data_len = aggregated.data.as_ref().map(|d| d.len()).unwrap_or(4);
    let mut out = Vec::with_capacity(data_len + errors_json.len() + 32);
    out.extend_from_slice(b"{\"data\":");
    match &aggregated.data {
        Some(data) => out.extend_from_slice(data),
        None => out.extend_from_slice(b"null"),
    }
    out.extend_from_slice(b",\"errors\":");
    out.extend_from_slice(errors_json.as_bytes());
    out.extend_from_slice(b",\"partial\":");
    out.extend_from_slice(if aggregated.partial {
        &b"true"[..]
    } else {
        &b"false"[..]
    });
    out.push(b'}');
    out.into()
}

fn write_back(resp: OutboundResponse) -> Response<BoxBody> {
    let OutboundResponse {
        status,
        mut headers,
        body,
    } = resp;

    // Framing is hyper's job; stale upstream values would corrupt it.
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);
    headers.remove(CONNECTION);

    let mut builder = Response::builder().status(status);
    if let Some(map) = builder.headers_mut() {
        *map = headers;
    }
    builder.body(full_body(body)).unwrap()
}

fn resolve_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string())
}

fn echo_request_id(resp: &mut Response<BoxBody>, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
}

/// Trust the left-most `X-Forwarded-For` entry when present (a reverse proxy
/// in front is assumed to maintain it), otherwise use the TCP peer.
fn resolve_client_ip(headers: &HeaderMap, peer_addr: SocketAddr) -> std::net::IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<std::net::IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip())
}

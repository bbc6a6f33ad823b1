use crate::error::JsonError;
use crate::routing::CompiledRoute;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request extension carrying the resolved request id into the middleware
/// chain.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Request extension carrying the downstream client IP (TCP peer or trusted
/// `X-Forwarded-For` left-most entry).
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub IpAddr);

/// The mutable view of the inbound request handed to request plugins and the
/// dispatcher. The body is not part of the view — it is read once, bounded,
/// by the dispatcher.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// The response under assembly. Written back to the client after response
/// plugins have run; the status starts at 200 and is overwritten by the
/// pipeline or by plugins.
#[derive(Debug)]
pub struct OutboundResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Default for OutboundResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// Per-request context handed to plugins. Lives for exactly one request and
/// is never shared across requests.
pub struct PluginContext {
    pub request: InboundRequest,
    pub response: OutboundResponse,
    pub route: Arc<CompiledRoute>,
    pub request_id: String,
    /// Free-form bag for passing state between plugins of one request.
    pub data: HashMap<String, serde_json::Value>,
}

impl PluginContext {
    pub fn new(request: InboundRequest, route: Arc<CompiledRoute>, request_id: String) -> Self {
        Self {
            request,
            response: OutboundResponse::default(),
            route,
            request_id,
            data: HashMap::new(),
        }
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    pub fn data(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(route: Arc<CompiledRoute>) -> Self {
        Self::new(
            InboundRequest {
                method: Method::GET,
                uri: Uri::from_static("/test"),
                headers: HeaderMap::new(),
            },
            route,
            "test-request-id".to_owned(),
        )
    }
}

/// Build the JSON error envelope `{code, message, request_id}`.
/// The single exit point for every client-visible error.
pub fn error_response(
    status: StatusCode,
    code: &'static str,
    message: &str,
    request_id: &str,
) -> hyper::Response<BoxBody> {
    let envelope = JsonError {
        code,
        message: message.to_owned(),
        request_id: if request_id.is_empty() {
            None
        } else {
            Some(request_id.to_owned())
        },
    };
    let body = serde_json::to_vec(&envelope)
        .unwrap_or_else(|_| br#"{"code":"INTERNAL","message":"internal error"}"#.to_vec());

    let mut builder = hyper::Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json");
    if !request_id.is_empty() {
        builder = builder.header(REQUEST_ID_HEADER, request_id);
    }
    builder.body(full_body(body)).unwrap()
}

/// Observability shim around one request: bumps the in-flight gauge on
/// construction and guarantees the gauge decrement plus duration histogram
/// on every exit path via `Drop`.
pub struct RequestMetrics {
    route: String,
    method: String,
    start: Instant,
}

impl RequestMetrics {
    pub fn start(route: &str, method: &Method) -> Self {
        metrics::gauge!(
            "gateway_requests_in_flight",
            "route" => route.to_owned(),
        )
        .increment(1.0);

        Self {
            route: route.to_owned(),
            method: method.as_str().to_owned(),
            start: Instant::now(),
        }
    }

    /// Record the final status counter. The duration/gauge bookkeeping
    /// happens in `Drop` regardless.
    pub fn record_status(&self, status: StatusCode) {
        let mut buf = itoa::Buffer::new();
        metrics::counter!(
            "gateway_requests_total",
            "route" => self.route.clone(),
            "method" => self.method.clone(),
            "status_code" => buf.format(status.as_u16()).to_owned(),
        )
        .increment(1);
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start.elapsed().as_millis()
    }
}

impl Drop for RequestMetrics {
    fn drop(&mut self) {
        metrics::histogram!(
            "gateway_request_duration_seconds",
            "route" => self.route.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        metrics::gauge!(
            "gateway_requests_in_flight",
            "route" => self.route.clone(),
        )
        .decrement(1.0);
    }
}

use crate::error::{DispatchError, UpstreamError, UpstreamErrorKind};
use crate::proxy::context::{BoxBody, InboundRequest};
use crate::routing::CompiledRoute;
use crate::upstream::{Upstream, UpstreamResponse};
use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;
use tracing::{error, warn};

/// Cap on the buffered inbound body. The buffer is shared by every upstream
/// attempt, so one read serves the whole fan-out.
pub const MAX_BODY_SIZE: usize = 5 << 20;

/// Fan the inbound request out to every upstream of the route.
///
/// Returns one response per upstream, index-aligned with
/// `route.upstreams`. The calls run concurrently as futures owned by the
/// request task — dropping the request (client disconnect) cancels all of
/// them, including retry backoff sleeps. Completion order is arbitrary;
/// result order is not.
pub async fn dispatch(
    route: &CompiledRoute,
    inbound: &InboundRequest,
    body: BoxBody,
) -> Result<Vec<UpstreamResponse>, DispatchError> {
    let buffered = read_bounded_body(body).await?;
    let query = inbound.uri.query();

    let calls = route.upstreams.iter().map(|upstream| {
        let buffered = buffered.clone();
        async move {
            let mut resp = upstream
                .call(&inbound.method, &inbound.headers, query, &buffered)
                .await;

            if let Some(err) = &resp.err {
                metrics::counter!(
                    "gateway_failed_requests_total",
                    "reason" => "upstream_error",
                )
                .increment(1);
                error!("dispatch: cannot call upstream, name={}, error={}", upstream.name(), err);
            }

            if resp.status != 0 {
                let mut buf = itoa::Buffer::new();
                metrics::counter!(
                    "gateway_upstream_responses_total",
                    "status" => buf.format(resp.status).to_owned(),
                )
                .increment(1);
            }

            apply_policy(upstream, &mut resp);
            resp
        }
    });

    Ok(futures_util::future::join_all(calls).await)
}

/// Evaluate the upstream policy against a completed call: remap the status,
/// then check the body requirement and the allowed-status set. Violations
/// fold into the response error and are reported once per response.
fn apply_policy(upstream: &Upstream, resp: &mut UpstreamResponse) {
    let policy = upstream.policy();

    if let Some(mapped) = policy.map_status_codes.get(&resp.status) {
        resp.status = *mapped;
    }

    let mut violations: Vec<String> = Vec::new();
    let mut bad_status = false;

    if policy.require_body && resp.body.as_ref().map(|b| b.is_empty()).unwrap_or(true) {
        violations.push("empty body not allowed by upstream policy".to_owned());
    }

    if !policy.allowed_statuses.is_empty() && !policy.allowed_statuses.contains(&resp.status) {
        violations.push(format!("status {} not allowed by upstream policy", resp.status));
        bad_status = true;
    }

    if violations.is_empty() {
        return;
    }

    metrics::counter!(
        "gateway_failed_requests_total",
        "reason" => "policy_violation",
    )
    .increment(1);
    warn!(
        "dispatch: upstream policy violated, name={}, violations={}",
        upstream.name(),
        violations.join("; ")
    );

    let joined = violations.join("; ");
    match &mut resp.err {
        Some(err) => err.push_violation(&joined),
        None => {
            let kind = if bad_status {
                UpstreamErrorKind::BadStatus
            } else {
                UpstreamErrorKind::PolicyViolation
            };
            resp.err = Some(UpstreamError::new(kind, joined));
        }
    }
}

/// Buffer the inbound body, failing as soon as it exceeds the cap. Every
/// retry and every upstream replays this one buffer.
async fn read_bounded_body(mut body: BoxBody) -> Result<Bytes, DispatchError> {
    let mut buf = BytesMut::new();

    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                error!("dispatch: cannot read request body, error={}", e);
                metrics::counter!(
                    "gateway_failed_requests_total",
                    "reason" => "gateway_error",
                )
                .increment(1);
                return Err(DispatchError::BodyRead(e.to_string()));
            }
        };

        if let Some(data) = frame.data_ref() {
            if buf.len() + data.len() > MAX_BODY_SIZE {
                metrics::counter!(
                    "gateway_failed_requests_total",
                    "reason" => "body_too_large",
                )
                .increment(1);
                return Err(DispatchError::BodyTooLarge);
            }
            buf.extend_from_slice(data);
        }
    }

    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PolicyConfig, UpstreamConfig};
    use crate::proxy::context::full_body;
    use crate::testing::{spawn_upstream, text_response};
    use http::{HeaderMap, HeaderValue, Method, Uri};
    use std::collections::HashMap;

    fn upstream(url: &str, policy: PolicyConfig) -> Upstream {
        let cfg = UpstreamConfig {
            name: "u".into(),
            url: url.into(),
            method: String::new(),
            timeout: 1_000,
            headers: HashMap::new(),
            forward_headers: Vec::new(),
            forward_query_strings: Vec::new(),
            policy,
        };
        Upstream::from_config(&cfg, reqwest::Client::new()).unwrap()
    }

    fn route_with(upstreams: Vec<Upstream>) -> CompiledRoute {
        let mut route = CompiledRoute::for_tests();
        route.upstreams = upstreams;
        route
    }

    fn inbound(uri: &str) -> InboundRequest {
        InboundRequest {
            method: Method::GET,
            uri: uri.parse::<Uri>().unwrap(),
            headers: HeaderMap::new(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_returns_results_in_route_order() {
        let addr_a = spawn_upstream(|_p, _b| async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            text_response(200, "A")
        })
        .await;
        let addr_b = spawn_upstream(|_p, _b| async { text_response(200, "B") }).await;

        let route = route_with(vec![
            upstream(&format!("http://{}/", addr_a), PolicyConfig::default()),
            upstream(&format!("http://{}/", addr_b), PolicyConfig::default()),
        ]);

        let results = dispatch(&route, &inbound("/test"), full_body(""))
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        // A is slower but still lands in slot 0.
        assert_eq!(results[0].body.as_deref(), Some(b"A".as_slice()));
        assert_eq!(results[1].body.as_deref(), Some(b"B".as_slice()));
    }

    #[tokio::test]
    async fn test_dispatch_forwards_query_and_headers() {
        let addr = spawn_upstream(|parts, _b| async move {
            let query = parts.uri.query().unwrap_or("").to_owned();
            let header = parts
                .headers
                .get("x-test")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_owned();
            text_response(200, &format!("{}-{}", query, header))
        })
        .await;

        let mut cfg = PolicyConfig::default();
        cfg.retry_policy.max_retries = 0;
        let mut u = UpstreamConfig {
            name: "u".into(),
            url: format!("http://{}/", addr),
            method: String::new(),
            timeout: 1_000,
            headers: HashMap::new(),
            forward_headers: vec!["X-Test".into()],
            forward_query_strings: vec!["foo".into()],
            policy: cfg,
        };
        u.name = "forwarder".into();
        let route = route_with(vec![Upstream::from_config(&u, reqwest::Client::new()).unwrap()]);

        let mut req = inbound("/t?foo=bar&extra=1");
        req.headers
            .insert("x-test", HeaderValue::from_static("baz"));

        let results = dispatch(&route, &req, full_body("")).await.unwrap();
        assert_eq!(results[0].body.as_deref(), Some(b"foo=bar-baz".as_slice()));
    }

    #[tokio::test]
    async fn test_dispatch_replays_post_body_to_all_upstreams() {
        let echo = |_p: http::request::Parts, b: Bytes| async move {
            text_response(200, std::str::from_utf8(&b).unwrap_or(""))
        };
        let addr_a = spawn_upstream(echo).await;
        let addr_b = spawn_upstream(echo).await;

        let route = route_with(vec![
            upstream(&format!("http://{}/", addr_a), PolicyConfig::default()),
            upstream(&format!("http://{}/", addr_b), PolicyConfig::default()),
        ]);

        let mut req = inbound("/t");
        req.method = Method::POST;

        let results = dispatch(&route, &req, full_body("hello")).await.unwrap();
        assert_eq!(results[0].body.as_deref(), Some(b"hello".as_slice()));
        assert_eq!(results[1].body.as_deref(), Some(b"hello".as_slice()));
    }

    #[tokio::test]
    async fn test_dispatch_rejects_oversized_body() {
        let route = route_with(vec![upstream("http://127.0.0.1:9/", PolicyConfig::default())]);

        let oversized = vec![0u8; MAX_BODY_SIZE + 1];
        let result = dispatch(&route, &inbound("/t"), full_body(oversized)).await;

        assert!(matches!(result, Err(DispatchError::BodyTooLarge)));
    }

    #[tokio::test]
    async fn test_dispatch_accepts_body_at_cap() {
        let addr = spawn_upstream(|_p, _b| async { text_response(200, "ok") }).await;
        let route = route_with(vec![upstream(
            &format!("http://{}/", addr),
            PolicyConfig::default(),
        )]);

        let at_cap = vec![0u8; MAX_BODY_SIZE];
        let results = dispatch(&route, &inbound("/t"), full_body(at_cap))
            .await
            .unwrap();
        assert!(results[0].err.is_none());
    }

    #[tokio::test]
    async fn test_policy_require_body_violation() {
        let addr = spawn_upstream(|_p, _b| async { text_response(204, "") }).await;

        let policy = PolicyConfig {
            require_body: Some(true),
            ..Default::default()
        };
        let route = route_with(vec![upstream(&format!("http://{}/", addr), policy)]);

        let results = dispatch(&route, &inbound("/t"), full_body("")).await.unwrap();

        let err = results[0].err.as_ref().unwrap();
        assert_eq!(err.kind, UpstreamErrorKind::PolicyViolation);
        assert!(err.message().contains("empty body"));
    }

    #[tokio::test]
    async fn test_policy_maps_status_before_allowed_check() {
        let addr = spawn_upstream(|_p, _b| async { text_response(404, "{}") }).await;

        let policy = PolicyConfig {
            allowed_statuses: vec![200],
            map_status_codes: HashMap::from([(404, 200)]),
            ..Default::default()
        };
        let route = route_with(vec![upstream(&format!("http://{}/", addr), policy)]);

        let results = dispatch(&route, &inbound("/t"), full_body("")).await.unwrap();

        // 404 was remapped to 200 before the allowed-status check.
        assert_eq!(results[0].status, 200);
        assert!(results[0].err.is_none());
    }

    #[tokio::test]
    async fn test_policy_disallowed_status_is_bad_status() {
        let addr = spawn_upstream(|_p, _b| async { text_response(500, "{}") }).await;

        let policy = PolicyConfig {
            allowed_statuses: vec![200],
            ..Default::default()
        };
        let route = route_with(vec![upstream(&format!("http://{}/", addr), policy)]);

        let results = dispatch(&route, &inbound("/t"), full_body("")).await.unwrap();

        let err = results[0].err.as_ref().unwrap();
        assert_eq!(err.kind, UpstreamErrorKind::BadStatus);
        assert!(err.message().contains("status 500"));
    }
}

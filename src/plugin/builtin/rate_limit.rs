use crate::error::ERROR_CODE_RATE_LIMIT_EXCEEDED;
use crate::plugin::{Handler, Middleware};
use crate::proxy::context::{error_response, ClientAddr, RequestId};
use crate::ratelimit::RateLimiter;
use anyhow::Result;
use http::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEFAULT_LIMIT: u32 = 60;
const DEFAULT_WINDOW_SECS: u64 = 60;

/// Middleware rejecting clients that exceed a fixed-window budget,
/// keyed by client IP. Config: `{ "limit": n, "window": seconds }`.
///
/// Each middleware instance owns its limiter; a config reload builds fresh
/// instances and the old sweeper stops when the last in-flight request
/// releases the previous router.
#[derive(Default)]
pub struct RateLimitMiddleware {
    limiter: Option<Arc<RateLimiter>>,
}

impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn init(&mut self, config: &serde_json::Value) -> Result<()> {
        let limit = config
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(DEFAULT_LIMIT);
        let window = config
            .get("window")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_WINDOW_SECS);

        let limiter = Arc::new(RateLimiter::new(limit, Duration::from_secs(window)));
        limiter.start_sweeper();
        self.limiter = Some(limiter);
        Ok(())
    }

    fn wrap(self: Arc<Self>, next: Handler) -> Handler {
        Box::new(move |req| {
            let Some(limiter) = self.limiter.as_ref() else {
                return next(req);
            };

            let key = req
                .extensions()
                .get::<ClientAddr>()
                .map(|addr| addr.0.to_string())
                .unwrap_or_else(|| "unknown".to_owned());

            if limiter.allow(&key) {
                return next(req);
            }

            debug!("middleware: rate_limit: rejected, key={}", key);
            metrics::counter!("gateway_rate_limit_rejected_total").increment(1);

            let request_id = req
                .extensions()
                .get::<RequestId>()
                .map(|id| id.0.clone())
                .unwrap_or_default();
            let resp = error_response(
                StatusCode::TOO_MANY_REQUESTS,
                ERROR_CODE_RATE_LIMIT_EXCEEDED,
                "rate limit exceeded",
                &request_id,
            );
            Box::pin(async move { resp })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::context::full_body;
    use hyper::{Request, Response};
    use std::net::{IpAddr, Ipv4Addr};

    fn passthrough() -> Handler {
        Box::new(|_req| {
            Box::pin(async {
                Response::builder()
                    .status(200)
                    .body(full_body("ok"))
                    .unwrap()
            })
        })
    }

    fn request_from(ip: IpAddr) -> Request<crate::proxy::context::BoxBody> {
        let mut req = Request::builder()
            .uri("/limited")
            .body(full_body(""))
            .unwrap();
        req.extensions_mut().insert(ClientAddr(ip));
        req.extensions_mut().insert(RequestId("rid-1".to_owned()));
        req
    }

    fn middleware(limit: u32) -> Arc<RateLimitMiddleware> {
        let mut mw = RateLimitMiddleware::default();
        mw.init(&serde_json::json!({ "limit": limit, "window": 60 }))
            .unwrap();
        Arc::new(mw)
    }

    #[tokio::test]
    async fn test_rejects_over_limit_per_client() {
        let mw = middleware(2);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        for _ in 0..2 {
            let resp = mw.clone().wrap(passthrough())(request_from(ip)).await;
            assert_eq!(resp.status(), 200);
        }

        let resp = mw.clone().wrap(passthrough())(request_from(ip)).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        // A different client is unaffected.
        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let resp = mw.clone().wrap(passthrough())(request_from(other)).await;
        assert_eq!(resp.status(), 200);
    }
}

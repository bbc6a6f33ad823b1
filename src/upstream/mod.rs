pub mod circuit_breaker;

pub use circuit_breaker::{BreakerState, CircuitBreaker};

use crate::config::{RetryPolicyConfig, UpstreamConfig};
use crate::error::{UpstreamError, UpstreamErrorKind};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Outcome of one upstream call chain (initial attempt + retries).
/// `status == 0` means no HTTP response was received at all.
#[derive(Debug, Clone, Default)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub err: Option<UpstreamError>,
}

/// Per-upstream acceptance rules, evaluated by the dispatcher after the call.
#[derive(Debug, Clone, Default)]
pub struct UpstreamPolicy {
    pub allowed_statuses: Vec<u16>,
    pub require_body: bool,
    pub map_status_codes: HashMap<u16, u16>,
    pub retry: RetryPolicyConfig,
}

/// One configured backend endpoint of a route.
///
/// Owns its circuit breaker; the shared `reqwest::Client` provides the
/// connection pool. Request shaping (method override, header/query
/// forwarding) happens here so every retry sees an identical request.
pub struct Upstream {
    name: String,
    url: Url,
    method: Option<Method>,
    timeout: Duration,
    headers: Vec<(String, String)>,
    forward_headers: Vec<String>,
    forward_query_strings: Vec<String>,
    policy: UpstreamPolicy,
    breaker: CircuitBreaker,
    client: reqwest::Client,
}

impl Upstream {
    pub fn from_config(cfg: &UpstreamConfig, client: reqwest::Client) -> anyhow::Result<Self> {
        let url = Url::parse(&cfg.url)?;

        let method = if cfg.method.is_empty() {
            None
        } else {
            Some(Method::from_bytes(cfg.method.as_bytes())?)
        };

        let policy = UpstreamPolicy {
            allowed_statuses: cfg.policy.allowed_statuses.clone(),
            require_body: cfg.policy.requires_body(),
            map_status_codes: cfg.policy.map_status_codes.clone(),
            retry: cfg.policy.retry_policy.clone(),
        };

        Ok(Self {
            name: if cfg.name.is_empty() {
                cfg.url.clone()
            } else {
                cfg.name.clone()
            },
            url,
            method,
            timeout: Duration::from_millis(cfg.timeout),
            headers: cfg
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            forward_headers: cfg.forward_headers.clone(),
            forward_query_strings: cfg.forward_query_strings.clone(),
            policy,
            breaker: CircuitBreaker::new(&cfg.policy.circuit_breaker),
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &UpstreamPolicy {
        &self.policy
    }

    /// Call the upstream with the retry policy applied.
    ///
    /// An attempt is retriable when it failed in transport (timeout or
    /// connection, including a breaker denial) or returned a status listed in
    /// `retry_on_statuses`. The backoff sleep between attempts is cancelled
    /// with the caller's future; the final attempt's response is returned
    /// even when every attempt failed.
    pub async fn call(
        &self,
        method: &Method,
        headers: &HeaderMap,
        query: Option<&str>,
        body: &Bytes,
    ) -> UpstreamResponse {
        let retry = &self.policy.retry;
        let mut resp = UpstreamResponse::default();

        for attempt in 0..=retry.max_retries {
            resp = self.call_once(method, headers, query, body).await;

            let retriable = match &resp.err {
                Some(e) => e.kind.is_transport(),
                None => retry.retry_on_statuses.contains(&resp.status),
            };
            if !retriable || attempt == retry.max_retries {
                break;
            }

            debug!(
                "upstream: retrying, name={}, attempt={}/{}, status={}",
                self.name,
                attempt + 1,
                retry.max_retries,
                resp.status
            );
            metrics::counter!(
                "gateway_upstream_retries_total",
                "upstream" => self.name.clone(),
                "reason" => if resp.err.is_some() { "transport" } else { "status" },
            )
            .increment(1);

            if retry.backoff_ms > 0 {
                tokio::time::sleep(Duration::from_millis(retry.backoff_ms)).await;
            }
        }

        resp
    }

    /// One attempt: breaker gate, shaped request, per-attempt timeout,
    /// breaker notification.
    async fn call_once(
        &self,
        method: &Method,
        headers: &HeaderMap,
        query: Option<&str>,
        body: &Bytes,
    ) -> UpstreamResponse {
        if !self.breaker.allow() {
            metrics::counter!(
                "gateway_circuit_breaker_rejected_total",
                "upstream" => self.name.clone(),
            )
            .increment(1);
            return UpstreamResponse {
                err: Some(UpstreamError::connection("circuit open")),
                ..Default::default()
            };
        }

        let resp = self.send(method, headers, query, body).await;

        if self.is_success(&resp) {
            self.breaker.on_success();
        } else {
            self.breaker.on_failure();
        }

        resp
    }

    async fn send(
        &self,
        inbound_method: &Method,
        inbound_headers: &HeaderMap,
        inbound_query: Option<&str>,
        body: &Bytes,
    ) -> UpstreamResponse {
        let method = self
            .method
            .clone()
            .unwrap_or_else(|| inbound_method.clone());

        let mut url = self.url.clone();
        self.resolve_query(&mut url, inbound_query);

        let mut request = self
            .client
            .request(method.clone(), url)
            .headers(self.resolve_headers(inbound_headers))
            .timeout(self.timeout);

        // Only body-accepting methods carry the buffered body.
        if matches!(method, Method::POST | Method::PUT | Method::PATCH) {
            request = request.body(body.clone());
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                return UpstreamResponse {
                    err: Some(classify_error(&e)),
                    ..Default::default()
                }
            }
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();

        match response.bytes().await {
            Ok(bytes) => UpstreamResponse {
                status,
                headers,
                body: Some(bytes),
                err: None,
            },
            Err(e) => UpstreamResponse {
                status,
                headers,
                body: None,
                err: Some(classify_error(&e)),
            },
        }
    }

    /// Success for breaker purposes: no error and an acceptable status
    /// (configured allow-list, or any 2xx when the list is empty).
    fn is_success(&self, resp: &UpstreamResponse) -> bool {
        if resp.err.is_some() {
            return false;
        }
        if self.policy.allowed_statuses.is_empty() {
            (200..300).contains(&resp.status)
        } else {
            self.policy.allowed_statuses.contains(&resp.status)
        }
    }

    /// Build the upstream query string from an empty accumulator:
    /// `"*"` copies the whole inbound query and stops the scan; any other
    /// entry copies that one key when present with a non-empty value.
    /// Prefix globs are not defined for query keys and match exactly.
    fn resolve_query(&self, url: &mut Url, inbound_query: Option<&str>) {
        let inbound: Vec<(String, String)> = inbound_query
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        let mut resolved: Vec<(String, String)> = Vec::new();
        for entry in &self.forward_query_strings {
            if entry == "*" {
                resolved = inbound.clone();
                break;
            }
            if let Some((key, value)) = inbound.iter().find(|(k, _)| k == entry) {
                if !value.is_empty() {
                    resolved.push((key.clone(), value.clone()));
                }
            }
        }

        url.set_query(None);
        if !resolved.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &resolved {
                pairs.append_pair(key, value);
            }
        }
    }

    /// Build the upstream header set from an empty accumulator:
    /// `"*"` clones every inbound header and stops the scan, `"prefix*"`
    /// copies matching names, anything else copies that one header when
    /// present and non-empty. Configured overrides then replace forwarded
    /// names, and `Content-Type` always mirrors the inbound request.
    fn resolve_headers(&self, inbound: &HeaderMap) -> HeaderMap {
        let mut resolved = HeaderMap::new();

        for entry in &self.forward_headers {
            if entry == "*" {
                resolved = inbound.clone();
                break;
            }

            if let Some(prefix) = entry.strip_suffix('*') {
                let prefix = prefix.to_ascii_lowercase();
                for (name, value) in inbound {
                    if name.as_str().starts_with(&prefix) {
                        resolved.append(name.clone(), value.clone());
                    }
                }
                continue;
            }

            if let Ok(name) = HeaderName::from_bytes(entry.as_bytes()) {
                if let Some(value) = inbound.get(&name) {
                    if !value.is_empty() {
                        resolved.insert(name, value.clone());
                    }
                }
            }
        }

        for (name, value) in &self.headers {
            if !self.forwards_header(name) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                resolved.insert(name, value);
            }
        }

        match inbound.get(CONTENT_TYPE) {
            Some(ct) => {
                resolved.insert(CONTENT_TYPE, ct.clone());
            }
            None => {
                resolved.remove(CONTENT_TYPE);
            }
        }

        resolved
    }

    fn forwards_header(&self, name: &str) -> bool {
        self.forward_headers
            .iter()
            .any(|f| f.eq_ignore_ascii_case(name))
    }
}

fn classify_error(e: &reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::timeout(e.to_string())
    } else if e.is_builder() || e.is_request() {
        UpstreamError::new(UpstreamErrorKind::Internal, e.to_string())
    } else {
        // Connect failures, resets mid-body, DNS errors.
        UpstreamError::connection(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, PolicyConfig};
    use crate::testing::{spawn_upstream, text_response};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn upstream_config(url: &str) -> UpstreamConfig {
        UpstreamConfig {
            name: "test".into(),
            url: url.into(),
            method: String::new(),
            timeout: 1_000,
            headers: HashMap::new(),
            forward_headers: Vec::new(),
            forward_query_strings: Vec::new(),
            policy: PolicyConfig::default(),
        }
    }

    fn build(cfg: &UpstreamConfig) -> Upstream {
        Upstream::from_config(cfg, reqwest::Client::new()).unwrap()
    }

    #[test]
    fn test_resolve_headers_exact_and_glob() {
        let mut cfg = upstream_config("http://127.0.0.1:1/");
        cfg.forward_headers = vec!["X-Test".into(), "X-Trace-*".into()];
        let u = build(&cfg);

        let mut inbound = HeaderMap::new();
        inbound.insert("x-test", HeaderValue::from_static("baz"));
        inbound.insert("x-trace-id", HeaderValue::from_static("t1"));
        inbound.insert("x-trace-span", HeaderValue::from_static("t2"));
        inbound.insert("x-other", HeaderValue::from_static("drop"));

        let resolved = u.resolve_headers(&inbound);
        assert_eq!(resolved.get("x-test").unwrap(), "baz");
        assert_eq!(resolved.get("x-trace-id").unwrap(), "t1");
        assert_eq!(resolved.get("x-trace-span").unwrap(), "t2");
        assert!(resolved.get("x-other").is_none());
    }

    #[test]
    fn test_resolve_headers_wildcard_copies_everything() {
        let mut cfg = upstream_config("http://127.0.0.1:1/");
        cfg.forward_headers = vec!["*".into()];
        let u = build(&cfg);

        let mut inbound = HeaderMap::new();
        inbound.insert("x-a", HeaderValue::from_static("1"));
        inbound.insert("x-b", HeaderValue::from_static("2"));

        let resolved = u.resolve_headers(&inbound);
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn test_resolve_headers_override_only_forwarded_names() {
        let mut cfg = upstream_config("http://127.0.0.1:1/");
        cfg.forward_headers = vec!["X-Api-Key".into()];
        cfg.headers = HashMap::from([
            ("X-Api-Key".to_string(), "configured".to_string()),
            ("X-Not-Forwarded".to_string(), "ignored".to_string()),
        ]);
        let u = build(&cfg);

        let mut inbound = HeaderMap::new();
        inbound.insert("x-api-key", HeaderValue::from_static("client"));

        let resolved = u.resolve_headers(&inbound);
        assert_eq!(resolved.get("x-api-key").unwrap(), "configured");
        assert!(resolved.get("x-not-forwarded").is_none());
    }

    #[test]
    fn test_resolve_headers_content_type_always_copied() {
        let cfg = upstream_config("http://127.0.0.1:1/");
        let u = build(&cfg);

        let mut inbound = HeaderMap::new();
        inbound.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let resolved = u.resolve_headers(&inbound);
        assert_eq!(resolved.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn test_resolve_query_exact_and_wildcard() {
        let mut cfg = upstream_config("http://127.0.0.1:1/path");
        cfg.forward_query_strings = vec!["foo".into()];
        let u = build(&cfg);

        let mut url = Url::parse("http://127.0.0.1:1/path").unwrap();
        u.resolve_query(&mut url, Some("foo=bar&extra=1"));
        assert_eq!(url.query(), Some("foo=bar"));

        let mut cfg = upstream_config("http://127.0.0.1:1/path");
        cfg.forward_query_strings = vec!["*".into()];
        let u = build(&cfg);
        let mut url = Url::parse("http://127.0.0.1:1/path").unwrap();
        u.resolve_query(&mut url, Some("foo=bar&extra=1"));
        assert_eq!(url.query(), Some("foo=bar&extra=1"));
    }

    #[test]
    fn test_resolve_query_skips_missing_and_empty() {
        let mut cfg = upstream_config("http://127.0.0.1:1/path");
        cfg.forward_query_strings = vec!["absent".into(), "empty".into()];
        let u = build(&cfg);

        let mut url = Url::parse("http://127.0.0.1:1/path").unwrap();
        u.resolve_query(&mut url, Some("empty=&other=1"));
        assert_eq!(url.query(), None);
    }

    #[tokio::test]
    async fn test_call_retries_on_status_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let addr = spawn_upstream(move |_parts, _body| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    text_response(503, "unavailable")
                } else {
                    text_response(200, "ok")
                }
            }
        })
        .await;

        let mut cfg = upstream_config(&format!("http://{}/", addr));
        cfg.policy.retry_policy = RetryPolicyConfig {
            max_retries: 2,
            retry_on_statuses: vec![503],
            backoff_ms: 10,
        };
        let u = build(&cfg);

        let resp = u
            .call(&Method::GET, &HeaderMap::new(), None, &Bytes::new())
            .await;

        assert_eq!(resp.status, 200);
        assert_eq!(resp.body.as_deref(), Some(b"ok".as_slice()));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_call_returns_final_failed_attempt() {
        let addr = spawn_upstream(|_parts, _body| async { text_response(503, "down") }).await;

        let mut cfg = upstream_config(&format!("http://{}/", addr));
        cfg.policy.retry_policy = RetryPolicyConfig {
            max_retries: 1,
            retry_on_statuses: vec![503],
            backoff_ms: 0,
        };
        let u = build(&cfg);

        let resp = u
            .call(&Method::GET, &HeaderMap::new(), None, &Bytes::new())
            .await;
        assert_eq!(resp.status, 503);
        assert!(resp.err.is_none());
    }

    #[tokio::test]
    async fn test_call_classifies_timeout() {
        let addr = spawn_upstream(|_parts, _body| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            text_response(200, "late")
        })
        .await;

        let mut cfg = upstream_config(&format!("http://{}/", addr));
        cfg.timeout = 50;
        let u = build(&cfg);

        let resp = u
            .call(&Method::GET, &HeaderMap::new(), None, &Bytes::new())
            .await;
        assert_eq!(resp.err.as_ref().unwrap().kind, UpstreamErrorKind::Timeout);
        assert_eq!(resp.status, 0);
    }

    #[tokio::test]
    async fn test_breaker_short_circuits_after_failures() {
        // Nothing listens on this port; every call is a connection failure.
        let mut cfg = upstream_config("http://127.0.0.1:9/");
        cfg.timeout = 200;
        cfg.policy.circuit_breaker = CircuitBreakerConfig {
            max_failures: 1,
            reset_timeout_ms: 60_000,
        };
        let u = build(&cfg);

        let first = u
            .call(&Method::GET, &HeaderMap::new(), None, &Bytes::new())
            .await;
        assert!(first.err.as_ref().unwrap().kind.is_transport());

        let second = u
            .call(&Method::GET, &HeaderMap::new(), None, &Bytes::new())
            .await;
        assert_eq!(second.err.as_ref().unwrap().message(), "circuit open");
    }

    #[tokio::test]
    async fn test_body_dropped_for_non_body_methods() {
        let addr = spawn_upstream(|_parts, body| async move {
            text_response(200, &format!("len={}", body.len()))
        })
        .await;

        let cfg = upstream_config(&format!("http://{}/", addr));
        let u = build(&cfg);

        let resp = u
            .call(
                &Method::GET,
                &HeaderMap::new(),
                None,
                &Bytes::from_static(b"should not be sent"),
            )
            .await;
        assert_eq!(resp.body.as_deref(), Some(b"len=0".as_slice()));
    }

    #[tokio::test]
    async fn test_method_override() {
        let addr = spawn_upstream(|parts, _body| async move {
            text_response(200, parts.method.as_str())
        })
        .await;

        let mut cfg = upstream_config(&format!("http://{}/", addr));
        cfg.method = "POST".into();
        let u = build(&cfg);

        let resp = u
            .call(&Method::GET, &HeaderMap::new(), None, &Bytes::new())
            .await;
        assert_eq!(resp.body.as_deref(), Some(b"POST".as_slice()));
    }
}

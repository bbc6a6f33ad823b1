use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Handle around the global metrics recorder.
///
/// The `metrics` crate macros (`counter!`, `gauge!`, `histogram!`) are the
/// metrics interface of the codebase; without an installed recorder they are
/// no-ops, which is what `Metrics::noop()` relies on. `install()` plugs in
/// the Prometheus recorder once at startup; the retained handle only serves
/// the `/metrics` endpoint.
#[derive(Clone, Default)]
pub struct Metrics {
    handle: Option<PrometheusHandle>,
}

impl Metrics {
    /// Install the global Prometheus recorder and register descriptions.
    /// Must be called at most once per process, before any macro use.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "gateway_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "gateway_request_duration_seconds",
            Unit::Seconds,
            "Request duration from the client's perspective"
        );
        describe_gauge!(
            "gateway_requests_in_flight",
            Unit::Count,
            "Requests currently being processed"
        );
        describe_counter!(
            "gateway_failed_requests_total",
            Unit::Count,
            "Requests that failed, by reason"
        );
        describe_counter!(
            "gateway_upstream_responses_total",
            Unit::Count,
            "Upstream responses received, by status"
        );
        describe_counter!(
            "gateway_upstream_retries_total",
            Unit::Count,
            "Upstream retry attempts"
        );
        describe_counter!(
            "gateway_circuit_breaker_rejected_total",
            Unit::Count,
            "Attempts rejected by an open circuit breaker"
        );
        describe_counter!(
            "gateway_rate_limit_rejected_total",
            Unit::Count,
            "Requests rejected by the rate limit middleware"
        );
        describe_counter!(
            "gateway_config_reloads_total",
            Unit::Count,
            "Config reload events"
        );
        describe_gauge!(
            "gateway_connections_active",
            Unit::Count,
            "Active downstream connections"
        );
        describe_counter!(
            "gateway_connections_total",
            Unit::Count,
            "Connections accepted"
        );

        Self {
            handle: Some(handle),
        }
    }

    /// A recorder-less handle. Macro call sites stay no-ops; `render()`
    /// yields an empty exposition. Used in tests.
    pub fn noop() -> Self {
        Self::default()
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

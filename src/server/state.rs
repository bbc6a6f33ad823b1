use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::routing::Router;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// Shared gateway state, cheaply cloneable.
///
/// The router lives behind a single swappable slot: request handling loads
/// it lock-free, a reload publishes a fresh instance, and in-flight requests
/// keep the previous one alive through their `Arc` until they finish.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub router: Arc<ArcSwap<Router>>,
    pub metrics: Metrics,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, metrics: Metrics) -> Result<Self> {
        let router = Router::build(&config)?;
        Ok(Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            router: Arc::new(ArcSwap::new(Arc::new(router))),
            metrics,
        })
    }

    /// Rebuild config and router from the file and publish both atomically.
    /// Any failure (read, parse, validation, plugin init) abandons the
    /// reload and leaves the running instance untouched.
    pub fn reload(&self, path: &Path) {
        let reloaded = GatewayConfig::load(path)
            .and_then(|config| Router::build(&config).map(|router| (config, router)));

        match reloaded {
            Ok((config, router)) => {
                let routes = config.routes.len();
                self.router.store(Arc::new(router));
                self.config.store(Arc::new(config));
                metrics::counter!(
                    "gateway_config_reloads_total",
                    "result" => "success",
                )
                .increment(1);
                info!("config: reloaded, routes={}", routes);
            }
            Err(e) => {
                metrics::counter!(
                    "gateway_config_reloads_total",
                    "result" => "error",
                )
                .increment(1);
                error!("config: reload abandoned, previous config keeps running: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(name: &str) -> String {
        format!(
            r#"{{ "name": "{}", "routes": [{{
                "path": "/r", "method": "GET",
                "upstreams": [{{ "url": "http://127.0.0.1:9/" }}]
            }}] }}"#,
            name
        )
    }

    #[tokio::test]
    async fn test_reload_swaps_config_and_router() {
        let tmp = std::env::temp_dir().join("fanout_gateway_reload_ok.json");
        std::fs::write(&tmp, minimal_config("before")).unwrap();

        let config = GatewayConfig::load(&tmp).unwrap();
        let state = GatewayState::new(config, Metrics::noop()).unwrap();
        assert_eq!(state.config.load().name, "before");

        std::fs::write(&tmp, minimal_config("after")).unwrap();
        state.reload(&tmp);
        assert_eq!(state.config.load().name, "after");

        std::fs::remove_file(&tmp).ok();
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_config() {
        let tmp = std::env::temp_dir().join("fanout_gateway_reload_bad.json");
        std::fs::write(&tmp, minimal_config("stable")).unwrap();

        let config = GatewayConfig::load(&tmp).unwrap();
        let state = GatewayState::new(config, Metrics::noop()).unwrap();

        std::fs::write(&tmp, "{ not json").unwrap();
        state.reload(&tmp);
        assert_eq!(state.config.load().name, "stable");

        // Valid JSON, invalid semantics (route without upstreams).
        std::fs::write(
            &tmp,
            r#"{ "name": "broken", "routes": [{ "path": "/r", "method": "GET", "upstreams": [] }] }"#,
        )
        .unwrap();
        state.reload(&tmp);
        assert_eq!(state.config.load().name, "stable");

        std::fs::remove_file(&tmp).ok();
    }
}

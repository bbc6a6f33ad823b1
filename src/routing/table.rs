use crate::config::GatewayConfig;
use crate::plugin::{build_middleware, build_plugin, Middleware, Plugin, PluginType};
use crate::upstream::Upstream;
use anyhow::Result;
use http::Method;
use std::sync::Arc;

/// A route compiled from config at load/reload time. Immutable during
/// request handling; a reload swaps the whole `Router` atomically.
pub struct CompiledRoute {
    pub path: String,
    pub method: Method,
    pub upstreams: Vec<Upstream>,
    /// Request-type plugins in declared order, global ones first.
    pub request_plugins: Vec<Arc<dyn Plugin>>,
    /// Response-type plugins in declared order, global ones first.
    pub response_plugins: Vec<Arc<dyn Plugin>>,
    /// Declared order; the first entry wraps outermost.
    pub middlewares: Vec<Arc<dyn Middleware>>,
    pub aggregate: String,
    pub allow_partial_results: bool,
}

impl CompiledRoute {
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            path: "/test".to_owned(),
            method: Method::GET,
            upstreams: Vec::new(),
            request_plugins: Vec::new(),
            response_plugins: Vec::new(),
            middlewares: Vec::new(),
            aggregate: String::new(),
            allow_partial_results: false,
        }
    }
}

/// The ordered route table. Matching is exact on `(method, path)` with the
/// first declared route winning.
pub struct Router {
    routes: Vec<Arc<CompiledRoute>>,
}

impl Router {
    /// Compile a router from config: plugins and middlewares are
    /// instantiated and initialized here, upstreams get fresh circuit
    /// breakers, and all routes share one HTTP client pool. Any failure
    /// aborts the build, which makes a bad reload abandonable.
    pub fn build(config: &GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| anyhow::anyhow!("cannot build upstream http client: {}", e))?;

        // Shared instances: one per declared global component, reused by
        // every route.
        let global_middlewares: Vec<Arc<dyn Middleware>> = config
            .middlewares
            .iter()
            .map(build_middleware)
            .collect::<Result<_>>()?;
        let global_plugins: Vec<Arc<dyn Plugin>> = config
            .plugins
            .iter()
            .map(build_plugin)
            .collect::<Result<_>>()?;

        let mut routes = Vec::with_capacity(config.routes.len());

        for route_cfg in &config.routes {
            let method = Method::from_bytes(route_cfg.method.to_uppercase().as_bytes())
                .map_err(|e| anyhow::anyhow!("invalid method {}: {}", route_cfg.method, e))?;

            let mut plugins = global_plugins.clone();
            for plugin_cfg in &route_cfg.plugins {
                plugins.push(build_plugin(plugin_cfg)?);
            }
            let (request_plugins, response_plugins): (Vec<_>, Vec<_>) = plugins
                .into_iter()
                .partition(|p| p.plugin_type() == PluginType::Request);

            let mut middlewares = global_middlewares.clone();
            for middleware_cfg in &route_cfg.middlewares {
                middlewares.push(build_middleware(middleware_cfg)?);
            }

            let upstreams = route_cfg
                .upstreams
                .iter()
                .map(|u| Upstream::from_config(u, client.clone()))
                .collect::<Result<Vec<_>>>()?;

            routes.push(Arc::new(CompiledRoute {
                path: route_cfg.path.clone(),
                method,
                upstreams,
                request_plugins,
                response_plugins,
                middlewares,
                aggregate: route_cfg.aggregate.clone(),
                allow_partial_results: route_cfg.allow_partial_results,
            }));
        }

        tracing::info!("routing: compiled route table, count={}", routes.len());
        Ok(Self { routes })
    }

    pub fn match_route(&self, method: &Method, path: &str) -> Option<Arc<CompiledRoute>> {
        self.routes
            .iter()
            .find(|r| r.method == *method && r.path == path)
            .cloned()
    }

    pub fn routes(&self) -> &[Arc<CompiledRoute>] {
        &self.routes
    }
}

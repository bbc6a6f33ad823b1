pub mod builtin;

use crate::config::ComponentConfig;
use crate::proxy::context::{BoxBody, PluginContext};
use anyhow::Result;
use hyper::{Request, Response};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, RwLock};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The composable request handler that middlewares wrap. The innermost
/// handler runs plugins, dispatch, and aggregation; each middleware receives
/// the next handler and returns its own.
pub type Handler = Box<dyn FnOnce(Request<BoxBody>) -> BoxFuture<Response<BoxBody>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginType {
    /// Runs before dispatch; may mutate the request view and the context bag.
    Request,
    /// Runs after aggregation; may mutate the assembled response.
    Response,
}

/// User code invoked around the dispatch pipeline with the per-request
/// context. `execute` must be reentrant: one plugin instance serves every
/// route that references it, concurrently.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn plugin_type(&self) -> PluginType;
    fn init(&mut self, config: &serde_json::Value) -> Result<()>;
    fn execute(&self, ctx: &mut PluginContext);
}

/// User code wrapping the handler chain. Middlewares may short-circuit by
/// returning a response without invoking `next`; plugins may not.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;
    fn init(&mut self, config: &serde_json::Value) -> Result<()>;
    fn wrap(self: Arc<Self>, next: Handler) -> Handler;
}

pub type PluginFactory = fn() -> Box<dyn Plugin>;
pub type MiddlewareFactory = fn() -> Box<dyn Middleware>;

/// Static name → factory registry, populated with the builtins at first use.
/// Downstream crates extend it through `register_plugin` /
/// `register_middleware`; this replaces platform-native shared-object
/// loading.
fn plugin_registry() -> &'static RwLock<HashMap<&'static str, PluginFactory>> {
    static REGISTRY: OnceLock<RwLock<HashMap<&'static str, PluginFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<&'static str, PluginFactory> = HashMap::new();
        map.insert("logger", || Box::new(builtin::logger::LoggerPlugin::default()));
        map.insert("camelify", || Box::new(builtin::camelify::CamelifyPlugin));
        map.insert("snakeify", || Box::new(builtin::snakeify::SnakeifyPlugin));
        RwLock::new(map)
    })
}

fn middleware_registry() -> &'static RwLock<HashMap<&'static str, MiddlewareFactory>> {
    static REGISTRY: OnceLock<RwLock<HashMap<&'static str, MiddlewareFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<&'static str, MiddlewareFactory> = HashMap::new();
        map.insert("rate_limit", || {
            Box::new(builtin::rate_limit::RateLimitMiddleware::default())
        });
        RwLock::new(map)
    })
}

pub fn register_plugin(name: &'static str, factory: PluginFactory) {
    plugin_registry().write().unwrap().insert(name, factory);
}

pub fn register_middleware(name: &'static str, factory: MiddlewareFactory) {
    middleware_registry().write().unwrap().insert(name, factory);
}

/// Instantiate and initialize a plugin from its config block. An unknown
/// name or failing `init` aborts the router build (and thus the reload).
pub fn build_plugin(cfg: &ComponentConfig) -> Result<Arc<dyn Plugin>> {
    let factory = plugin_registry()
        .read()
        .unwrap()
        .get(cfg.name.as_str())
        .copied()
        .ok_or_else(|| anyhow::anyhow!("unknown plugin: {}", cfg.name))?;

    let mut plugin = factory();
    plugin
        .init(&cfg.config)
        .map_err(|e| anyhow::anyhow!("plugin {} init failed: {}", cfg.name, e))?;
    Ok(Arc::from(plugin))
}

pub fn build_middleware(cfg: &ComponentConfig) -> Result<Arc<dyn Middleware>> {
    let factory = middleware_registry()
        .read()
        .unwrap()
        .get(cfg.name.as_str())
        .copied()
        .ok_or_else(|| anyhow::anyhow!("unknown middleware: {}", cfg.name))?;

    let mut middleware = factory();
    middleware
        .init(&cfg.config)
        .map_err(|e| anyhow::anyhow!("middleware {} init failed: {}", cfg.name, e))?;
    Ok(Arc::from(middleware))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtins_are_registered() {
        for name in ["logger", "camelify", "snakeify"] {
            let cfg = ComponentConfig {
                name: name.into(),
                config: serde_json::Value::Null,
            };
            assert!(build_plugin(&cfg).is_ok(), "plugin {} missing", name);
        }

        let cfg = ComponentConfig {
            name: "rate_limit".into(),
            config: serde_json::json!({ "limit": 5, "window": 60 }),
        };
        assert!(build_middleware(&cfg).is_ok());
    }

    #[test]
    fn test_unknown_component_fails() {
        let cfg = ComponentConfig {
            name: "does-not-exist".into(),
            config: serde_json::Value::Null,
        };
        assert!(build_plugin(&cfg).is_err());
        assert!(build_middleware(&cfg).is_err());
    }

    #[test]
    fn test_register_custom_plugin() {
        struct Nop;
        impl Plugin for Nop {
            fn name(&self) -> &'static str {
                "nop-custom"
            }
            fn plugin_type(&self) -> PluginType {
                PluginType::Request
            }
            fn init(&mut self, _config: &serde_json::Value) -> Result<()> {
                Ok(())
            }
            fn execute(&self, _ctx: &mut PluginContext) {}
        }

        register_plugin("nop-custom", || Box::new(Nop));
        let cfg = ComponentConfig {
            name: "nop-custom".into(),
            config: serde_json::Value::Null,
        };
        let plugin = build_plugin(&cfg).unwrap();
        assert_eq!(plugin.plugin_type(), PluginType::Request);
    }
}

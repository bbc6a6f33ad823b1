use crate::plugin::{Plugin, PluginType};
use crate::proxy::context::PluginContext;
use anyhow::Result;
use tracing::info;

/// Request-phase plugin that logs one line per matched request.
#[derive(Default)]
pub struct LoggerPlugin {
    enabled: bool,
}

impl Plugin for LoggerPlugin {
    fn name(&self) -> &'static str {
        "logger"
    }

    fn plugin_type(&self) -> PluginType {
        PluginType::Request
    }

    fn init(&mut self, config: &serde_json::Value) -> Result<()> {
        self.enabled = config
            .get("enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        Ok(())
    }

    fn execute(&self, ctx: &mut PluginContext) {
        if !self.enabled {
            return;
        }
        info!(
            method = %ctx.request.method,
            path = %ctx.request.uri.path(),
            request_id = %ctx.request_id,
            "plugin: logger: request"
        );
    }
}

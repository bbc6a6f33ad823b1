use crate::plugin::{Plugin, PluginType};
use crate::proxy::context::PluginContext;
use anyhow::Result;
use bytes::Bytes;
use tracing::debug;

/// Response-phase plugin rewriting top-level camelCase JSON keys to
/// snake_case. The inverse of `camelify`.
pub struct SnakeifyPlugin;

impl Plugin for SnakeifyPlugin {
    fn name(&self) -> &'static str {
        "snakeify"
    }

    fn plugin_type(&self) -> PluginType {
        PluginType::Response
    }

    fn init(&mut self, _config: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn execute(&self, ctx: &mut PluginContext) {
        if ctx.response.body.is_empty() {
            return;
        }

        let obj: serde_json::Map<String, serde_json::Value> =
            match serde_json::from_slice(&ctx.response.body) {
                Ok(obj) => obj,
                Err(e) => {
                    debug!("plugin: snakeify: response body is not a JSON object: {}", e);
                    return;
                }
            };

        let renamed: serde_json::Map<String, serde_json::Value> = obj
            .into_iter()
            .map(|(key, value)| (camel_to_snake(&key), value))
            .collect();

        match serde_json::to_vec(&renamed) {
            Ok(body) => ctx.response.body = Bytes::from(body),
            Err(e) => debug!("plugin: snakeify: cannot serialize response: {}", e),
        }
    }
}

fn camel_to_snake(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);

    for (i, ch) in s.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }

    out
}

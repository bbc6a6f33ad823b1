use crate::plugin::{Plugin, PluginType};
use crate::proxy::context::PluginContext;
use anyhow::Result;
use bytes::Bytes;
use tracing::debug;

/// Response-phase plugin rewriting top-level snake_case JSON keys to
/// camelCase. Non-object bodies pass through untouched.
pub struct CamelifyPlugin;

impl Plugin for CamelifyPlugin {
    fn name(&self) -> &'static str {
        "camelify"
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
                    debug!("plugin: camelify: response body is not a JSON object: {}", e);
                    return;
                }
            };

        let renamed: serde_json::Map<String, serde_json::Value> = obj
            .into_iter()
            .map(|(key, value)| (snake_to_camel(&key), value))
            .collect();

        match serde_json::to_vec(&renamed) {
            Ok(body) => ctx.response.body = Bytes::from(body),
            Err(e) => debug!("plugin: camelify: cannot serialize response: {}", e),
        }
    }
}

pub(super) fn snake_to_camel(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut upper_next = false;

    for (i, ch) in s.chars().enumerate() {
        if ch == '_' && i > 0 {
            upper_next = true;
            continue;
        }
        if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }

    out
}

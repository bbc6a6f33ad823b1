pub mod types;


pub use types::*;

use anyhow::Result;
use std::path::{Path, PathBuf};

/// Environment variable naming the config file. Used when `--config` is not
/// passed on the command line.
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "./config.json";

/// Resolve the config file path: explicit CLI flag, then `GATEWAY_CONFIG`,
/// then `./config.json`.
pub fn resolve_path(cli_path: Option<PathBuf>) -> PathBuf {
    cli_path
        .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

impl GatewayConfig {
    /// Load and validate a configuration document. JSON is the primary
    /// format; `.toml` files are accepted by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config file {}: {}", path.display(), e))?;

        let config: GatewayConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };

        config.validate()?;
        tracing::info!(
            "config: loaded, path={}, routes={}",
            path.display(),
            config.routes.len()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for route in &self.routes {
            if route.path.is_empty() {
                anyhow::bail!("route path cannot be empty");
            }
            if !route.path.starts_with('/') {
                anyhow::bail!("route path must start with '/': {}", route.path);
            }
            if route.method.is_empty() {
                anyhow::bail!("route method cannot be empty, path={}", route.path);
            }
            if route.upstreams.is_empty() {
                anyhow::bail!("route has no upstreams, path={}", route.path);
            }
            match route.aggregate.as_str() {
                "" | AGGREGATE_MERGE | AGGREGATE_ARRAY => {}
                other => {
                    // Kept non-fatal: an unknown strategy yields an empty
                    // aggregate at request time.
                    tracing::warn!(
                        "config: unknown aggregation strategy, path={}, strategy={}",
                        route.path,
                        other
                    );
                }
            }

            for upstream in &route.upstreams {
                if upstream.url.is_empty() {
                    anyhow::bail!("upstream url cannot be empty, route={}", route.path);
                }
                url::Url::parse(&upstream.url).map_err(|e| {
                    anyhow::anyhow!("invalid upstream url {}: {}", upstream.url, e)
                })?;
                if upstream.timeout == 0 {
                    anyhow::bail!("upstream timeout must be positive, upstream={}", upstream.name);
                }
                if upstream.policy.circuit_breaker.max_failures == 0 {
                    anyhow::bail!(
                        "circuit breaker max_failures must be positive, upstream={}",
                        upstream.name
                    );
                }
            }
        }

        Ok(())
    }
}

pub mod types;

pub use types::*;

use crate::error::{RateLimitError, Result};
use std::path::Path;

impl RootConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — an empty limiter set, which is valid but inert.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: RootConfig = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| RateLimitError::configuration(format!("reading {}: {e}", path.display())))?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)
                    .map_err(|e| RateLimitError::configuration(format!("parsing {}: {e}", path.display())))?,
                Some("json") => serde_json::from_str(&content)
                    .map_err(|e| RateLimitError::configuration(format!("parsing {}: {e}", path.display())))?,
                Some(ext) => {
                    return Err(RateLimitError::configuration(format!(
                        "unsupported config format: .{ext}, use .toml or .json"
                    )))
                }
                None => {
                    return Err(RateLimitError::configuration(
                        "config file has no extension, use .toml or .json",
                    ))
                }
            }
        } else {
            tracing::info!(
                "config file not found at {}, starting with an empty limiter set",
                path.display()
            );
            RootConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(limiters = config.limiters.len(), "loaded rate limit configuration");
        Ok(config)
    }

    /// Environment overrides apply only to the distributed storage endpoint,
    /// consistent with the teacher's infrastructure-vs-business config split:
    /// policy shape (limiters, thresholds, templates) comes from the file,
    /// connection strings come from the environment.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("RATEKEEPER_REDIS_URL") {
            for limiter in self.limiters.values_mut() {
                limiter.storage.redis_url = Some(url.clone());
            }
        }
    }
}

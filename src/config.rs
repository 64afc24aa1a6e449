//! Configuration management for Floodgate.
//!
//! Everything the middleware needs to run is collected in [`GateConfig`],
//! which can be built in code, deserialized from YAML, or loaded from a
//! file. Unset fields fall back to the documented defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{FloodgateError, Result};

/// Main configuration for a Floodgate gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Which store backs the limiter
    #[serde(default)]
    pub driver: Driver,

    /// Maximum number of calls allowed per window
    #[serde(default = "default_max")]
    pub max: u64,

    /// Window length in milliseconds
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,

    /// Prefix for store keys, shared by every identity behind this gate
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// HTTP status returned when a call is rejected
    #[serde(default = "default_status")]
    pub status: u16,

    /// Override for the rejection body; when unset a retry hint is generated
    #[serde(default)]
    pub error_message: Option<String>,

    /// Suppress the informational rate limit headers entirely
    #[serde(default)]
    pub disable_headers: bool,

    /// Attach the rejection to the response extensions for upstream handlers
    #[serde(default = "default_reject_with_error")]
    pub reject_with_error: bool,

    /// What to do when the store cannot be reached
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Names used for the informational headers
    #[serde(default)]
    pub headers: HeaderNames,

    /// Connection URL for the Redis driver
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            driver: Driver::default(),
            max: default_max(),
            duration_ms: default_duration_ms(),
            namespace: default_namespace(),
            status: default_status(),
            error_message: None,
            disable_headers: false,
            reject_with_error: default_reject_with_error(),
            failure_mode: FailureMode::default(),
            headers: HeaderNames::default(),
            redis_url: None,
        }
    }
}

fn default_max() -> u64 {
    2500
}

fn default_duration_ms() -> u64 {
    3_600_000
}

fn default_namespace() -> String {
    "limit".to_string()
}

fn default_status() -> u16 {
    429
}

fn default_reject_with_error() -> bool {
    true
}

impl GateConfig {
    /// The configured window length.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading gate configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse gate config: {}", e)))
    }
}

/// The store driving a gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    /// In-process table, scoped to this instance
    #[default]
    Memory,
    /// Shared Redis store, scoped to everything pointed at the same server
    Redis,
}

impl FromStr for Driver {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(Driver::Memory),
            "redis" => Ok(Driver::Redis),
            other => Err(FloodgateError::Config(format!(
                "invalid driver. Expecting memory or redis, got {}",
                other
            ))),
        }
    }
}

/// Behavior when the store is unreachable during evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Refuse the call with a 500 when the store cannot be consulted
    #[default]
    Closed,
    /// Wave the call through unlimited when the store cannot be consulted
    Open,
}

/// Names for the informational headers attached to gated responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderNames {
    /// Calls left in the current window
    #[serde(default = "default_header_remaining")]
    pub remaining: String,

    /// When the window expires, in Unix epoch seconds
    #[serde(default = "default_header_reset")]
    pub reset: String,

    /// Total calls allowed per window
    #[serde(default = "default_header_total")]
    pub total: String,
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self {
            remaining: default_header_remaining(),
            reset: default_header_reset(),
            total: default_header_total(),
        }
    }
}

fn default_header_remaining() -> String {
    "X-RateLimit-Remaining".to_string()
}

fn default_header_reset() -> String {
    "X-RateLimit-Reset".to_string()
}

fn default_header_total() -> String {
    "X-RateLimit-Limit".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GateConfig::default();
        assert_eq!(config.driver, Driver::Memory);
        assert_eq!(config.max, 2500);
        assert_eq!(config.duration_ms, 3_600_000);
        assert_eq!(config.namespace, "limit");
        assert_eq!(config.status, 429);
        assert!(config.error_message.is_none());
        assert!(!config.disable_headers);
        assert!(config.reject_with_error);
        assert_eq!(config.failure_mode, FailureMode::Closed);
        assert_eq!(config.headers.remaining, "X-RateLimit-Remaining");
        assert_eq!(config.headers.reset, "X-RateLimit-Reset");
        assert_eq!(config.headers.total, "X-RateLimit-Limit");
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
driver: redis
max: 100
duration_ms: 60000
namespace: api
status: 503
error_message: "Slow down."
disable_headers: true
reject_with_error: false
failure_mode: open
headers:
  remaining: Rate-Limit-Remaining
  reset: Rate-Limit-Reset
  total: Rate-Limit-Total
redis_url: redis://127.0.0.1:6379
"#;
        let config = GateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.driver, Driver::Redis);
        assert_eq!(config.max, 100);
        assert_eq!(config.duration(), Duration::from_secs(60));
        assert_eq!(config.namespace, "api");
        assert_eq!(config.status, 503);
        assert_eq!(config.error_message.as_deref(), Some("Slow down."));
        assert!(config.disable_headers);
        assert!(!config.reject_with_error);
        assert_eq!(config.failure_mode, FailureMode::Open);
        assert_eq!(config.headers.remaining, "Rate-Limit-Remaining");
        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
    }

    #[test]
    fn test_parse_partial_yaml_fills_defaults() {
        let yaml = r#"
max: 10
duration_ms: 1000
"#;
        let config = GateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.max, 10);
        assert_eq!(config.duration_ms, 1000);
        assert_eq!(config.driver, Driver::Memory);
        assert_eq!(config.namespace, "limit");
        assert_eq!(config.status, 429);
        assert!(config.reject_with_error);
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = GateConfig::from_yaml("max: not_a_number");
        assert!(matches!(result, Err(FloodgateError::Config(_))));
    }

    #[test]
    fn test_driver_from_str() {
        assert_eq!(Driver::from_str("memory").unwrap(), Driver::Memory);
        assert_eq!(Driver::from_str("redis").unwrap(), Driver::Redis);

        let err = Driver::from_str("dynamo").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: invalid driver. Expecting memory or redis, got dynamo"
        );
    }
}

//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};

/// Connection settings for the session persistence service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the sync API (sessions, profiles, share links).
    /// Default: http://localhost:8080/
    #[serde(default = "ApiConfig::default_base_url")]
    pub base_url: String,

    /// Request timeout in milliseconds.
    /// Default: 10000
    #[serde(default = "ApiConfig::default_timeout_ms")]
    pub timeout_ms: u64,

    /// Bearer token sent with every request, if any.
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl ApiConfig {
    fn default_base_url() -> String {
        "http://localhost:8080/".to_string()
    }

    fn default_timeout_ms() -> u64 {
        10_000
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            timeout_ms: Self::default_timeout_ms(),
            auth_token: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_defaults() {
        let api = ApiConfig::default();
        assert_eq!(api.base_url, "http://localhost:8080/");
        assert_eq!(api.timeout_ms, 10_000);
        assert!(api.auth_token.is_none());
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let api: ApiConfig = toml::from_str("timeout_ms = 500").unwrap();
        assert_eq!(api.timeout_ms, 500);
        assert_eq!(api.base_url, "http://localhost:8080/");
    }
}

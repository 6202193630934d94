//! Common configuration types for role sync components.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines (default).
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Output format of the fmt layer.
    pub log_format: LogFormat,
    /// Filter directive used when `RUST_LOG` is not set.
    pub default_filter: String,
}

#[derive(Debug, Error)]
pub enum ObservabilityConfigError {
    #[error("Invalid LOG_FORMAT '{0}': expected 'text' or 'json'")]
    InvalidLogFormat(String),
}

impl ObservabilityConfig {
    /// Read `LOG_FORMAT` from the given variables.
    pub fn from_vars(
        vars: &HashMap<String, String>,
        default_filter: &str,
    ) -> Result<Self, ObservabilityConfigError> {
        let log_format = match vars.get("LOG_FORMAT").map(|s| s.trim().to_ascii_lowercase()) {
            None => LogFormat::Text,
            Some(value) if value == "text" => LogFormat::Text,
            Some(value) if value == "json" => LogFormat::Json,
            Some(value) => return Err(ObservabilityConfigError::InvalidLogFormat(value)),
        };

        Ok(Self {
            log_format,
            default_filter: default_filter.to_string(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_format_is_text() {
        let config = ObservabilityConfig::from_vars(&HashMap::new(), "role_sync=info").unwrap();
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.default_filter, "role_sync=info");
    }

    #[test]
    fn test_json_log_format_is_case_insensitive() {
        let vars = HashMap::from([("LOG_FORMAT".to_string(), "JSON".to_string())]);
        let config = ObservabilityConfig::from_vars(&vars, "info").unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_unknown_log_format_is_rejected() {
        let vars = HashMap::from([("LOG_FORMAT".to_string(), "xml".to_string())]);
        let result = ObservabilityConfig::from_vars(&vars, "info");
        assert!(matches!(result, Err(ObservabilityConfigError::InvalidLogFormat(v)) if v == "xml"));
    }
}

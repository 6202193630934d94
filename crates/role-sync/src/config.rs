//! Role sync configuration.
//!
//! Configuration is loaded from environment variables. Credentials are held
//! as `SecretString` and redacted in Debug output.

use crate::services::reconciler::ReconcilerConfig;
use crate::services::retry_queue::RetryConfig;
use common::config::{ObservabilityConfig, ObservabilityConfigError};
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8090";

/// Default path of the singleton admin roster record.
pub const DEFAULT_ROSTER_DOCUMENT_PATH: &str = "config/admins";

/// Default tracing filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "role_sync=info,tower_http=info";

/// Upper bound for `RECONCILE_MAX_ATTEMPTS`.
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// Default graceful shutdown drain in seconds.
pub const DEFAULT_DRAIN_SECONDS: u64 = 5;

/// Role sync service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address (default: "0.0.0.0:8090").
    pub bind_address: String,

    /// Path of the singleton roster record; updates to any other record are ignored.
    pub roster_document_path: String,

    /// Base URL of the identity service API, without trailing slash.
    pub identity_api_url: String,

    /// Bearer token for the identity service API.
    pub identity_api_token: SecretString,

    /// HMAC key for trigger request signatures. Unset disables verification.
    pub trigger_signing_secret: Option<SecretString>,

    /// Fan-out, retry and deadline settings for a reconciliation pass.
    pub reconciler: ReconcilerConfig,

    /// Follow-up retry of identities that failed reconciliation.
    pub retry: RetryConfig,

    pub observability: ObservabilityConfig,

    /// Seconds to wait after a shutdown signal before exiting.
    pub drain_seconds: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },

    #[error(transparent)]
    Observability(#[from] ObservabilityConfigError),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let roster_document_path = vars
            .get("ROSTER_DOCUMENT_PATH")
            .map(|p| p.trim().trim_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_ROSTER_DOCUMENT_PATH.to_string());

        if roster_document_path.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "ROSTER_DOCUMENT_PATH".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        let identity_api_url = vars
            .get("IDENTITY_API_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("IDENTITY_API_URL".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let identity_api_token = vars
            .get("IDENTITY_API_TOKEN")
            .ok_or_else(|| ConfigError::MissingEnvVar("IDENTITY_API_TOKEN".to_string()))
            .map(|t| SecretString::from(t.clone()))?;

        let trigger_signing_secret = vars
            .get("TRIGGER_SIGNING_SECRET")
            .filter(|s| !s.is_empty())
            .map(|s| SecretString::from(s.clone()));

        let reconciler_defaults = ReconcilerConfig::default();
        let retry_defaults = RetryConfig::default();

        let max_attempts: u32 = parse_positive(
            vars,
            "RECONCILE_MAX_ATTEMPTS",
            reconciler_defaults.max_attempts,
        )?;
        if max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(ConfigError::InvalidValue {
                name: "RECONCILE_MAX_ATTEMPTS".to_string(),
                reason: format!("must not exceed {}, got {}", MAX_ATTEMPTS_LIMIT, max_attempts),
            });
        }

        let reconciler = ReconcilerConfig {
            max_concurrency: parse_positive(
                vars,
                "RECONCILE_MAX_CONCURRENCY",
                reconciler_defaults.max_concurrency,
            )?,
            max_attempts,
            identity_timeout: Duration::from_millis(parse_positive(
                vars,
                "RECONCILE_IDENTITY_TIMEOUT_MS",
                millis(reconciler_defaults.identity_timeout),
            )?),
            invocation_deadline: Duration::from_secs(parse_positive(
                vars,
                "RECONCILE_DEADLINE_SECONDS",
                reconciler_defaults.invocation_deadline.as_secs(),
            )?),
            ..reconciler_defaults
        };

        let retry = RetryConfig {
            interval: Duration::from_secs(parse_positive(
                vars,
                "RETRY_INTERVAL_SECONDS",
                retry_defaults.interval.as_secs(),
            )?),
            max_passes: parse_positive(vars, "RETRY_MAX_PASSES", retry_defaults.max_passes)?,
        };

        let observability = ObservabilityConfig::from_vars(vars, DEFAULT_LOG_FILTER)?;

        let drain_seconds = match vars.get("ROLE_SYNC_DRAIN_SECONDS") {
            Some(value) => value.parse().map_err(|e| ConfigError::InvalidValue {
                name: "ROLE_SYNC_DRAIN_SECONDS".to_string(),
                reason: format!("expected a non-negative integer, got '{}': {}", value, e),
            })?,
            None => DEFAULT_DRAIN_SECONDS,
        };

        Ok(Config {
            bind_address,
            roster_document_path,
            identity_api_url,
            identity_api_token,
            trigger_signing_secret,
            reconciler,
            retry,
            observability,
            drain_seconds,
        })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Parse an optional positive integer variable.
fn parse_positive<T>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let Some(value_str) = vars.get(name) else {
        return Ok(default);
    };

    let value: T = value_str.parse().map_err(|e| ConfigError::InvalidValue {
        name: name.to_string(),
        reason: format!("expected a positive integer, got '{}': {}", value_str, e),
    })?;

    if value <= T::default() {
        return Err(ConfigError::InvalidValue {
            name: name.to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }

    Ok(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::config::LogFormat;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            (
                "IDENTITY_API_URL".to_string(),
                "http://identity.local:9000/".to_string(),
            ),
            ("IDENTITY_API_TOKEN".to_string(), "svc-token".to_string()),
        ])
    }

    #[test]
    fn test_from_vars_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.roster_document_path, "config/admins");
        assert_eq!(config.identity_api_url, "http://identity.local:9000");
        assert_eq!(config.identity_api_token.expose_secret(), "svc-token");
        assert!(config.trigger_signing_secret.is_none());
        assert_eq!(config.reconciler.max_concurrency, 8);
        assert_eq!(config.reconciler.max_attempts, 3);
        assert_eq!(config.reconciler.identity_timeout, Duration::from_secs(5));
        assert_eq!(config.reconciler.invocation_deadline, Duration::from_secs(60));
        assert_eq!(config.retry.interval, Duration::from_secs(60));
        assert_eq!(config.retry.max_passes, 10);
        assert_eq!(config.observability.log_format, LogFormat::Text);
        assert_eq!(config.drain_seconds, 5);
    }

    #[test]
    fn test_from_vars_overrides() {
        let mut vars = base_vars();
        vars.insert("BIND_ADDRESS".to_string(), "127.0.0.1:9100".to_string());
        vars.insert("ROSTER_DOCUMENT_PATH".to_string(), "/settings/admins/".to_string());
        vars.insert("TRIGGER_SIGNING_SECRET".to_string(), "hook-secret".to_string());
        vars.insert("RECONCILE_MAX_CONCURRENCY".to_string(), "2".to_string());
        vars.insert("RECONCILE_MAX_ATTEMPTS".to_string(), "5".to_string());
        vars.insert("RECONCILE_IDENTITY_TIMEOUT_MS".to_string(), "250".to_string());
        vars.insert("RECONCILE_DEADLINE_SECONDS".to_string(), "10".to_string());
        vars.insert("RETRY_INTERVAL_SECONDS".to_string(), "30".to_string());
        vars.insert("RETRY_MAX_PASSES".to_string(), "4".to_string());
        vars.insert("LOG_FORMAT".to_string(), "json".to_string());
        vars.insert("ROLE_SYNC_DRAIN_SECONDS".to_string(), "0".to_string());

        let config = Config::from_vars(&vars).unwrap();

        assert_eq!(config.bind_address, "127.0.0.1:9100");
        assert_eq!(config.roster_document_path, "settings/admins");
        assert_eq!(
            config
                .trigger_signing_secret
                .as_ref()
                .map(|s| s.expose_secret().to_string()),
            Some("hook-secret".to_string())
        );
        assert_eq!(config.reconciler.max_concurrency, 2);
        assert_eq!(config.reconciler.max_attempts, 5);
        assert_eq!(config.reconciler.identity_timeout, Duration::from_millis(250));
        assert_eq!(config.reconciler.invocation_deadline, Duration::from_secs(10));
        assert_eq!(config.retry.interval, Duration::from_secs(30));
        assert_eq!(config.retry.max_passes, 4);
        assert_eq!(config.observability.log_format, LogFormat::Json);
        assert_eq!(config.drain_seconds, 0);
    }

    #[test]
    fn test_from_vars_missing_identity_api_url() {
        let mut vars = base_vars();
        vars.remove("IDENTITY_API_URL");

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "IDENTITY_API_URL"));
    }

    #[test]
    fn test_from_vars_missing_identity_api_token() {
        let mut vars = base_vars();
        vars.remove("IDENTITY_API_TOKEN");

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "IDENTITY_API_TOKEN"));
    }

    #[test]
    fn test_from_vars_zero_concurrency_rejected() {
        let mut vars = base_vars();
        vars.insert("RECONCILE_MAX_CONCURRENCY".to_string(), "0".to_string());

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue { name, .. }) if name == "RECONCILE_MAX_CONCURRENCY")
        );
    }

    #[test]
    fn test_from_vars_non_numeric_timeout_rejected() {
        let mut vars = base_vars();
        vars.insert("RECONCILE_IDENTITY_TIMEOUT_MS".to_string(), "soon".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { reason, .. }) if reason.contains("'soon'")
        ));
    }

    #[test]
    fn test_from_vars_too_many_attempts_rejected() {
        let mut vars = base_vars();
        vars.insert("RECONCILE_MAX_ATTEMPTS".to_string(), "11".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { reason, .. }) if reason.contains("must not exceed 10")
        ));
    }

    #[test]
    fn test_from_vars_empty_signing_secret_disables_verification() {
        let mut vars = base_vars();
        vars.insert("TRIGGER_SIGNING_SECRET".to_string(), String::new());

        let config = Config::from_vars(&vars).unwrap();
        assert!(config.trigger_signing_secret.is_none());
    }

    #[test]
    fn test_from_vars_blank_document_path_rejected() {
        let mut vars = base_vars();
        vars.insert("ROSTER_DOCUMENT_PATH".to_string(), "/".to_string());

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue { name, .. }) if name == "ROSTER_DOCUMENT_PATH")
        );
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let mut vars = base_vars();
        vars.insert("TRIGGER_SIGNING_SECRET".to_string(), "hook-secret".to_string());
        let config = Config::from_vars(&vars).unwrap();

        let debug = format!("{config:?}");
        assert!(!debug.contains("svc-token"));
        assert!(!debug.contains("hook-secret"));
        assert!(debug.contains("identity.local"));
    }
}

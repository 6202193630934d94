//! Metrics definitions for the role sync service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `role_sync_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `outcome`: pass and identity outcome labels defined by the reconciler
//! - `stage`: fetch, write, pending
//! - `error`: `ClaimsError::label` values
//! - `endpoint`: the three served routes plus `/other`

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used by `/metrics`.
///
/// Must be called before any metric is recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("role_sync_http_request".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set HTTP request buckets: {e}"))?
        // A pass is bounded by the invocation deadline (60s by default)
        .set_buckets_for_metric(
            Matcher::Full("role_sync_pass_duration_seconds".to_string()),
            &[
                0.001, 0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000, 30.000,
                60.000,
            ],
        )
        .map_err(|e| format!("Failed to set pass duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Record the end of a reconciliation pass.
///
/// Metric: `role_sync_passes_total`, `role_sync_pass_duration_seconds`
/// Labels: `outcome` (completed, wrong_record, missing_after_state, no_change)
pub fn record_pass(outcome: &str, duration: Duration) {
    histogram!("role_sync_pass_duration_seconds",
        "outcome" => outcome.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("role_sync_passes_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record one identity's result within a pass.
///
/// Metric: `role_sync_identity_outcomes_total`
/// Labels: `outcome` (updated, already_correct, failed)
pub fn record_identity_outcome(outcome: &str) {
    counter!("role_sync_identity_outcomes_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a failed identity pipeline.
///
/// Metric: `role_sync_claim_failures_total`
/// Labels: `stage`, `error`
pub fn record_claim_failure(stage: &str, error: &str) {
    counter!("role_sync_claim_failures_total",
        "stage" => stage.to_string(),
        "error" => error.to_string()
    )
    .increment(1);
}

/// Set the number of identities waiting for a follow-up retry.
///
/// Metric: `role_sync_pending_retries`
pub fn set_pending_retries(count: usize) {
    gauge!("role_sync_pending_retries").set(count as f64);
}

/// Record the result of one follow-up retry attempt.
///
/// Metric: `role_sync_retry_attempts_total`
/// Labels: `result` (resolved, requeued, abandoned, superseded)
pub fn record_retry_attempt(result: &str) {
    counter!("role_sync_retry_attempts_total",
        "result" => result.to_string()
    )
    .increment(1);
}

// ============================================================================
// HTTP Request Metrics
// ============================================================================

/// Record HTTP request completion.
///
/// Metric: `role_sync_http_requests_total`, `role_sync_http_request_duration_seconds`
/// Labels: `method`, `endpoint`, `status` / `status_code`
pub fn record_http_request(method: &str, endpoint: &str, status_code: u16, duration: Duration) {
    let normalized_endpoint = normalize_endpoint(endpoint);
    let status = categorize_status_code(status_code);

    histogram!("role_sync_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint,
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("role_sync_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

/// Map a request path onto a bounded endpoint label.
fn normalize_endpoint(path: &str) -> &'static str {
    match path {
        "/health" => "/health",
        "/metrics" => "/metrics",
        "/v1/triggers/roster-updated" => "/v1/triggers/roster-updated",
        _ => "/other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Recording without an installed recorder goes to the global no-op
    // recorder; these exercise the label paths only.

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("/health"), "/health");
        assert_eq!(normalize_endpoint("/metrics"), "/metrics");
        assert_eq!(
            normalize_endpoint("/v1/triggers/roster-updated"),
            "/v1/triggers/roster-updated"
        );
        assert_eq!(normalize_endpoint("/v1/triggers/other-record"), "/other");
        assert_eq!(normalize_endpoint("/"), "/other");
    }

    #[test]
    fn test_categorize_status_code() {
        assert_eq!(categorize_status_code(200), "success");
        assert_eq!(categorize_status_code(204), "success");
        assert_eq!(categorize_status_code(401), "error");
        assert_eq!(categorize_status_code(408), "timeout");
        assert_eq!(categorize_status_code(500), "error");
        assert_eq!(categorize_status_code(504), "timeout");
    }

    #[test]
    fn test_record_functions_do_not_panic() {
        record_pass("completed", Duration::from_millis(120));
        record_pass("no_change", Duration::from_micros(40));
        record_identity_outcome("updated");
        record_identity_outcome("failed");
        record_claim_failure("write", "unavailable");
        set_pending_retries(3);
        set_pending_retries(0);
        record_retry_attempt("resolved");
        record_http_request(
            "POST",
            "/v1/triggers/roster-updated",
            200,
            Duration::from_millis(80),
        );
        record_http_request("GET", "/nope", 404, Duration::from_millis(1));
    }
}

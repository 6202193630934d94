//! HTTP routes for the role sync service.
//!
//! Defines the Axum router and application state.

use crate::config::Config;
use crate::handlers;
use crate::middleware::http_metrics_middleware;
use crate::services::retry_queue::RetryQueue;
use crate::services::trigger::RosterTrigger;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Added on top of two reconciliation deadlines to get the request timeout.
/// A trigger pass may first wait out a retry pass, which has the same deadline.
const REQUEST_TIMEOUT_MARGIN: Duration = Duration::from_secs(30);

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,

    /// Roster update entry point.
    pub trigger: Arc<RosterTrigger>,

    /// Shared with the claim retry task.
    pub retry_queue: Arc<RetryQueue>,
}

/// Build the application routes.
///
/// - `/health` - liveness probe with pending retry count
/// - `/metrics` - Prometheus metrics
/// - `/v1/triggers/roster-updated` - roster document update events
/// - TraceLayer, request timeout, HTTP metrics middleware (outermost)
pub fn build_routes(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let request_timeout = request_timeout(state.config.reconciler.invocation_deadline);

    let app_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/v1/triggers/roster-updated",
            post(handlers::roster_updated),
        )
        .with_state(state);

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    // Each .layer() wraps the ones before it:
    // 1. TraceLayer (innermost)
    // 2. TimeoutLayer
    // 3. http_metrics_middleware (outermost, sees timeouts and framework rejections)
    app_routes
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(middleware::from_fn(http_metrics_middleware))
}

fn request_timeout(invocation_deadline: Duration) -> Duration {
    invocation_deadline * 2 + REQUEST_TIMEOUT_MARGIN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_timeout_outlasts_queued_pass() {
        let deadline = Duration::from_secs(60);
        let timeout = request_timeout(deadline);
        assert_eq!(timeout, Duration::from_secs(150));
        assert!(timeout > deadline * 2);
    }

    #[test]
    fn test_app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }
}

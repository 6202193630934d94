//! Liveness endpoint.

use crate::routes::AppState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Identities waiting for a follow-up claim write.
    pub pending_retries: usize,
}

/// Liveness probe. Does not call the identity service.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        pending_retries: state.retry_queue.len().await,
    })
}

//! HTTP metrics middleware.
//!
//! Captures every response, including framework rejections that never reach
//! a handler (404, 405, 413).

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::observability::metrics::record_http_request;

/// Record method, normalized path, status and duration for each request.
///
/// Applied as the outermost layer.
pub async fn http_metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    record_http_request(&method, &path, response.status().as_u16(), start.elapsed());

    response
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::{get, post},
        Router,
    };
    use tower::ServiceExt;

    async fn accepted() -> StatusCode {
        StatusCode::OK
    }

    async fn unauthorized() -> StatusCode {
        StatusCode::UNAUTHORIZED
    }

    fn test_app() -> Router {
        Router::new()
            .route("/health", get(accepted))
            .route("/v1/triggers/roster-updated", post(unauthorized))
            .layer(middleware::from_fn(http_metrics_middleware))
    }

    async fn call(method: &str, uri: &str) -> StatusCode {
        let request = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("request builder should succeed");

        test_app()
            .oneshot(request)
            .await
            .expect("request should succeed")
            .status()
    }

    #[tokio::test]
    async fn test_middleware_passes_success_through() {
        assert_eq!(call("GET", "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_middleware_passes_handler_error_through() {
        assert_eq!(
            call("POST", "/v1/triggers/roster-updated").await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_middleware_sees_framework_rejections() {
        assert_eq!(call("GET", "/nonexistent").await, StatusCode::NOT_FOUND);
        assert_eq!(
            call("GET", "/v1/triggers/roster-updated").await,
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}

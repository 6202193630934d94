//! Roster update trigger endpoint.
//!
//! `POST /v1/triggers/roster-updated` receives document-update events from
//! the document database. When a signing secret is configured the raw body
//! must be signed with HMAC-SHA256 and the hex tag sent in
//! `X-Trigger-Signature`.
//!
//! Reconciliation failures are reported in the response body, never as an
//! error status, so the caller does not redeliver a partially applied pass.

use crate::errors::RoleSyncError;
use crate::models::RosterUpdateEvent;
use crate::routes::AppState;
use crate::services::reconciler::ReconcileOutcome;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use common::secret::{ExposeSecret, SecretString};
use common::types::IdentityId;
use ring::hmac;
use serde::Serialize;
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Header carrying the hex HMAC-SHA256 of the request body.
pub const SIGNATURE_HEADER: &str = "x-trigger-signature";

/// Summary of a handled trigger.
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    /// `skipped` or `completed`.
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_id: Option<Uuid>,
    pub added: Vec<IdentityId>,
    pub removed: Vec<IdentityId>,
    pub updated: Vec<IdentityId>,
    pub already_correct: Vec<IdentityId>,
    pub failed: Vec<IdentityId>,
}

impl From<&ReconcileOutcome> for TriggerResponse {
    fn from(outcome: &ReconcileOutcome) -> Self {
        match outcome {
            ReconcileOutcome::Skipped(reason) => TriggerResponse {
                status: "skipped",
                reason: Some(reason.label()),
                pass_id: None,
                added: Vec::new(),
                removed: Vec::new(),
                updated: Vec::new(),
                already_correct: Vec::new(),
                failed: Vec::new(),
            },
            ReconcileOutcome::Completed(report) => TriggerResponse {
                status: "completed",
                reason: None,
                pass_id: Some(report.pass_id),
                added: report.delta.added.iter().cloned().collect(),
                removed: report.delta.removed.iter().cloned().collect(),
                updated: report.updated().into_iter().cloned().collect(),
                already_correct: report.already_correct().into_iter().cloned().collect(),
                failed: report.failed().into_iter().cloned().collect(),
            },
        }
    }
}

/// Handler for `POST /v1/triggers/roster-updated`.
///
/// # Errors
///
/// - 401 when a signing secret is configured and the signature is missing or wrong
/// - 400 when the body is not a valid roster update event
#[instrument(skip_all, name = "role_sync.handlers.roster_updated")]
pub async fn roster_updated(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<TriggerResponse>, RoleSyncError> {
    if let Some(secret) = &state.config.trigger_signing_secret {
        verify_signature(secret, &headers, &body)?;
    }

    let event: RosterUpdateEvent = serde_json::from_slice(&body).map_err(|e| {
        warn!(
            target: "role_sync.handlers.trigger",
            error = %e,
            "Rejecting malformed trigger payload"
        );
        RoleSyncError::BadRequest("Malformed trigger payload".to_string())
    })?;

    let outcome = state.trigger.handle(event).await;

    Ok(Json(TriggerResponse::from(&outcome)))
}

/// Check `X-Trigger-Signature` against the HMAC-SHA256 of `body`.
///
/// Comparison is constant-time via `hmac::verify`.
pub fn verify_signature(
    secret: &SecretString,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), RoleSyncError> {
    let Some(header) = headers.get(SIGNATURE_HEADER) else {
        warn!(target: "role_sync.handlers.trigger", "Trigger request missing signature");
        return Err(RoleSyncError::InvalidSignature);
    };

    let provided = header
        .to_str()
        .ok()
        .and_then(|value| hex::decode(value.trim()).ok())
        .ok_or_else(|| {
            warn!(target: "role_sync.handlers.trigger", "Trigger signature is not valid hex");
            RoleSyncError::InvalidSignature
        })?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.expose_secret().as_bytes());
    hmac::verify(&key, body, &provided).map_err(|_| {
        warn!(target: "role_sync.handlers.trigger", "Trigger signature mismatch");
        RoleSyncError::InvalidSignature
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::services::reconciler::SkipReason;
    use axum::http::HeaderValue;

    fn secret() -> SecretString {
        SecretString::from("hook-secret".to_string())
    }

    fn sign(body: &[u8]) -> String {
        let key = hmac::Key::new(hmac::HMAC_SHA256, b"hook-secret");
        hex::encode(hmac::sign(&key, body).as_ref())
    }

    fn headers_with(signature: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(signature).unwrap());
        headers
    }

    #[test]
    fn test_valid_signature_accepted() {
        let body = br#"{"document":"config/admins"}"#;
        assert!(verify_signature(&secret(), &headers_with(&sign(body)), body).is_ok());
    }

    #[test]
    fn test_missing_signature_rejected() {
        let result = verify_signature(&secret(), &HeaderMap::new(), b"{}");
        assert!(matches!(result, Err(RoleSyncError::InvalidSignature)));
    }

    #[test]
    fn test_signature_over_other_body_rejected() {
        let signature = sign(b"{}");
        let result = verify_signature(&secret(), &headers_with(&signature), b"{ }");
        assert!(matches!(result, Err(RoleSyncError::InvalidSignature)));
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        let result = verify_signature(&secret(), &headers_with("not-hex"), b"{}");
        assert!(matches!(result, Err(RoleSyncError::InvalidSignature)));
    }

    #[test]
    fn test_skipped_response_shape() {
        let response =
            TriggerResponse::from(&ReconcileOutcome::Skipped(SkipReason::WrongRecord));
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "wrong_record");
        assert!(json.get("pass_id").is_none());
        assert_eq!(json["updated"], serde_json::json!([]));
    }
}

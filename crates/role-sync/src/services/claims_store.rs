//! Identity claims collaborator.
//!
//! The reconciler only needs two operations from the identity service: read an
//! identity's custom claims and replace them wholesale. [`ClaimsStore`] is that
//! seam; [`HttpClaimsStore`] talks to the identity service REST API and
//! [`mock::MockClaimsStore`] backs the tests.
//!
//! # HTTP mapping
//!
//! - `GET  {base}/v1/identities/{id}`        -> `{"customClaims": {...}}`
//! - `PUT  {base}/v1/identities/{id}/claims` <- `{"customClaims": {...}}`
//! - 404 -> `NotFound`, 429/5xx/transport -> `Unavailable`, other 4xx -> `Rejected`

use crate::errors::ClaimsError;
use crate::models::Claims;
use common::secret::{ExposeSecret, SecretString};
use common::types::IdentityId;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Default timeout for identity service requests in seconds.
const IDENTITY_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default connect timeout in seconds.
const IDENTITY_CONNECT_TIMEOUT_SECS: u64 = 5;

/// An identity as returned by the identity service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    /// Missing and `null` both mean no claims.
    #[serde(default, deserialize_with = "claims_or_empty")]
    pub custom_claims: Claims,
}

fn claims_or_empty<'de, D>(deserializer: D) -> Result<Claims, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Claims>::deserialize(deserializer)?.unwrap_or_default())
}

/// Identity claims operations (enables mocking).
#[async_trait::async_trait]
pub trait ClaimsStore: Send + Sync {
    /// Fetch an identity's current custom claims.
    async fn get_identity(&self, id: &IdentityId) -> Result<IdentityRecord, ClaimsError>;

    /// Replace the entire custom claims map of an identity.
    async fn set_custom_claims(&self, id: &IdentityId, claims: Claims) -> Result<(), ClaimsError>;
}

#[derive(Debug, Error)]
pub enum ClaimsStoreInitError {
    #[error("Invalid identity service URL '{0}'")]
    InvalidBaseUrl(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SetClaimsRequest<'a> {
    custom_claims: &'a Claims,
}

/// Identity service REST client.
#[derive(Clone)]
pub struct HttpClaimsStore {
    client: Client,
    base_url: Url,
    token: SecretString,
}

impl HttpClaimsStore {
    /// Create a new identity service client.
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` is not an absolute http(s) URL or the
    /// HTTP client cannot be built.
    pub fn new(base_url: &str, token: SecretString) -> Result<Self, ClaimsStoreInitError> {
        let parsed = Url::parse(base_url)
            .map_err(|_| ClaimsStoreInitError::InvalidBaseUrl(base_url.to_string()))?;
        if parsed.cannot_be_a_base() || !matches!(parsed.scheme(), "http" | "https") {
            return Err(ClaimsStoreInitError::InvalidBaseUrl(base_url.to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(IDENTITY_REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(IDENTITY_CONNECT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: parsed,
            token,
        })
    }

    /// `{base}/v1/identities/{id}[/tail...]` with the id percent-encoded as one segment.
    fn identity_url(&self, id: &IdentityId, tail: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["v1", "identities", id.as_str()])
                .extend(tail);
        }
        url
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }
}

/// Map a non-success status to a `ClaimsError`.
fn check_status(response: Response) -> Result<Response, ClaimsError> {
    let status = response.status();

    if status.is_success() {
        Ok(response)
    } else if status == StatusCode::NOT_FOUND {
        Err(ClaimsError::NotFound)
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        warn!(target: "role_sync.claims_store", status = %status, "Identity service returned a retryable status");
        Err(ClaimsError::Unavailable(format!("status {}", status.as_u16())))
    } else {
        warn!(target: "role_sync.claims_store", status = %status, "Identity service rejected request");
        Err(ClaimsError::Rejected(status.as_u16()))
    }
}

fn transport_error(e: reqwest::Error) -> ClaimsError {
    warn!(target: "role_sync.claims_store", error = %e, "Identity service request failed");
    ClaimsError::Unavailable("identity service unreachable".to_string())
}

#[async_trait::async_trait]
impl ClaimsStore for HttpClaimsStore {
    #[instrument(skip_all, name = "role_sync.claims_store.get_identity", fields(identity_id = %id))]
    async fn get_identity(&self, id: &IdentityId) -> Result<IdentityRecord, ClaimsError> {
        let response = self
            .client
            .get(self.identity_url(id, &[]))
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(transport_error)?;

        let record = check_status(response)?
            .json::<IdentityRecord>()
            .await
            .map_err(|e| ClaimsError::InvalidResponse(e.to_string()))?;

        debug!(target: "role_sync.claims_store", claim_count = record.custom_claims.len(), "Fetched identity claims");
        Ok(record)
    }

    #[instrument(skip_all, name = "role_sync.claims_store.set_custom_claims", fields(identity_id = %id))]
    async fn set_custom_claims(&self, id: &IdentityId, claims: Claims) -> Result<(), ClaimsError> {
        let response = self
            .client
            .put(self.identity_url(id, &["claims"]))
            .header("Authorization", self.bearer())
            .json(&SetClaimsRequest {
                custom_claims: &claims,
            })
            .send()
            .await
            .map_err(transport_error)?;

        check_status(response)?;
        Ok(())
    }
}

/// Mock claims store module for testing.
///
/// This module provides an in-memory identity directory with failure
/// injection and call recording.
pub mod mock {
    use super::*;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Debug, Clone)]
    struct InjectedFailure {
        error: ClaimsError,
        /// `None` fails forever.
        remaining: Option<u32>,
    }

    impl InjectedFailure {
        /// Consume one failure, if any is left.
        fn take(&mut self) -> Option<ClaimsError> {
            match &mut self.remaining {
                None => Some(self.error.clone()),
                Some(0) => None,
                Some(n) => {
                    *n -= 1;
                    Some(self.error.clone())
                }
            }
        }
    }

    /// In-memory identity directory.
    ///
    /// Identities that were never seeded answer `NotFound`.
    #[derive(Debug, Default)]
    pub struct MockClaimsStore {
        identities: Mutex<HashMap<IdentityId, Claims>>,
        fetch_failures: Mutex<HashMap<IdentityId, InjectedFailure>>,
        write_failures: Mutex<HashMap<IdentityId, InjectedFailure>>,
        delays: HashMap<IdentityId, Duration>,
        writes: Mutex<Vec<(IdentityId, Claims)>>,
        fetch_calls: AtomicUsize,
        write_calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockClaimsStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed an identity. Non-object `claims` seed an empty map.
        pub fn with_identity(mut self, id: &str, claims: Value) -> Self {
            let claims = match claims {
                Value::Object(map) => map,
                _ => Claims::new(),
            };
            self.identities
                .get_mut()
                .insert(IdentityId::from(id), claims);
            self
        }

        /// Every fetch of `id` fails with `error`.
        pub fn failing_fetch(self, id: &str, error: ClaimsError) -> Self {
            self.fetch_failure(id, error, None)
        }

        /// The first `times` fetches of `id` fail with `error`.
        pub fn failing_fetch_times(self, id: &str, error: ClaimsError, times: u32) -> Self {
            self.fetch_failure(id, error, Some(times))
        }

        /// Every write to `id` fails with `error`.
        pub fn failing_write(self, id: &str, error: ClaimsError) -> Self {
            self.write_failure(id, error, None)
        }

        /// The first `times` writes to `id` fail with `error`.
        pub fn failing_write_times(self, id: &str, error: ClaimsError, times: u32) -> Self {
            self.write_failure(id, error, Some(times))
        }

        /// Delay every fetch of `id` by `delay`.
        pub fn with_fetch_delay(mut self, id: &str, delay: Duration) -> Self {
            self.delays.insert(IdentityId::from(id), delay);
            self
        }

        fn fetch_failure(mut self, id: &str, error: ClaimsError, remaining: Option<u32>) -> Self {
            self.fetch_failures
                .get_mut()
                .insert(IdentityId::from(id), InjectedFailure { error, remaining });
            self
        }

        fn write_failure(mut self, id: &str, error: ClaimsError, remaining: Option<u32>) -> Self {
            self.write_failures
                .get_mut()
                .insert(IdentityId::from(id), InjectedFailure { error, remaining });
            self
        }

        /// Stop injecting failures for `id`.
        pub async fn heal(&self, id: &str) {
            let id = IdentityId::from(id);
            self.fetch_failures.lock().await.remove(&id);
            self.write_failures.lock().await.remove(&id);
        }

        /// Current claims of `id`.
        pub async fn claims_of(&self, id: &str) -> Option<Claims> {
            self.identities
                .lock()
                .await
                .get(&IdentityId::from(id))
                .cloned()
        }

        /// Current admin claim of `id`, if set to a boolean.
        pub async fn admin_of(&self, id: &str) -> Option<bool> {
            self.claims_of(id)
                .await
                .and_then(|claims| claims.get(crate::models::ADMIN_CLAIM).and_then(Value::as_bool))
        }

        /// Successful writes in order.
        pub async fn writes(&self) -> Vec<(IdentityId, Claims)> {
            self.writes.lock().await.clone()
        }

        /// Ids of successfully written identities, in write order.
        pub async fn written_ids(&self) -> Vec<String> {
            self.writes
                .lock()
                .await
                .iter()
                .map(|(id, _)| id.to_string())
                .collect()
        }

        /// Number of `get_identity` calls, including failed ones.
        pub fn fetch_count(&self) -> usize {
            self.fetch_calls.load(Ordering::SeqCst)
        }

        /// Number of `set_custom_claims` calls, including failed ones.
        pub fn write_count(&self) -> usize {
            self.write_calls.load(Ordering::SeqCst)
        }

        /// Total collaborator calls.
        pub fn call_count(&self) -> usize {
            self.fetch_count() + self.write_count()
        }

        /// Highest number of concurrently running fetches observed.
        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ClaimsStore for MockClaimsStore {
        async fn get_identity(&self, id: &IdentityId) -> Result<IdentityRecord, ClaimsError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);

            if let Some(delay) = self.delays.get(id) {
                tokio::time::sleep(*delay).await;
            } else {
                tokio::task::yield_now().await;
            }

            let result = async {
                if let Some(failure) = self.fetch_failures.lock().await.get_mut(id) {
                    if let Some(error) = failure.take() {
                        return Err(error);
                    }
                }

                self.identities
                    .lock()
                    .await
                    .get(id)
                    .cloned()
                    .map(|custom_claims| IdentityRecord { custom_claims })
                    .ok_or(ClaimsError::NotFound)
            }
            .await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn set_custom_claims(
            &self,
            id: &IdentityId,
            claims: Claims,
        ) -> Result<(), ClaimsError> {
            self.write_calls.fetch_add(1, Ordering::SeqCst);

            if let Some(failure) = self.write_failures.lock().await.get_mut(id) {
                if let Some(error) = failure.take() {
                    return Err(error);
                }
            }

            let mut identities = self.identities.lock().await;
            let Some(existing) = identities.get_mut(id) else {
                return Err(ClaimsError::NotFound);
            };
            *existing = claims.clone();
            drop(identities);

            self.writes.lock().await.push((id.clone(), claims));
            Ok(())
        }
    }

}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> HttpClaimsStore {
        HttpClaimsStore::new(&server.uri(), SecretString::from("svc-token")).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_base_url() {
        let result = HttpClaimsStore::new("not a url", SecretString::from("t"));
        assert!(matches!(result, Err(ClaimsStoreInitError::InvalidBaseUrl(_))));

        let result = HttpClaimsStore::new("mailto:admin@example.com", SecretString::from("t"));
        assert!(matches!(result, Err(ClaimsStoreInitError::InvalidBaseUrl(_))));
    }

    #[test]
    fn test_identity_url_encodes_id_as_one_segment() {
        let store =
            HttpClaimsStore::new("http://identity.local:9000/api/", SecretString::from("t")).unwrap();
        let url = store.identity_url(&IdentityId::from("team/alice"), &["claims"]);
        assert_eq!(
            url.as_str(),
            "http://identity.local:9000/api/v1/identities/team%2Falice/claims"
        );
    }

    #[tokio::test]
    async fn test_get_identity_parses_custom_claims() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/identities/u1"))
            .and(header("authorization", "Bearer svc-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uid": "u1",
                "customClaims": {"plan": "pro", "admin": false}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let record = store_for(&server)
            .get_identity(&IdentityId::from("u1"))
            .await
            .unwrap();
        assert_eq!(record.custom_claims.get("plan"), Some(&json!("pro")));
        assert_eq!(record.custom_claims.get("admin"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn test_get_identity_without_claims_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/identities/u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"uid": "u1"})))
            .mount(&server)
            .await;

        let record = store_for(&server)
            .get_identity(&IdentityId::from("u1"))
            .await
            .unwrap();
        assert!(record.custom_claims.is_empty());
    }

    #[tokio::test]
    async fn test_get_identity_with_null_claims_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/identities/u1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"uid": "u1", "customClaims": null})),
            )
            .mount(&server)
            .await;

        let record = store_for(&server)
            .get_identity(&IdentityId::from("u1"))
            .await
            .unwrap();
        assert!(record.custom_claims.is_empty());
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        for (id, status) in [("missing", 404), ("busy", 503), ("limited", 429), ("denied", 403)] {
            Mock::given(method("GET"))
                .and(path(format!("/v1/identities/{id}")))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;
        }
        let store = store_for(&server);

        assert_eq!(
            store.get_identity(&IdentityId::from("missing")).await,
            Err(ClaimsError::NotFound)
        );
        assert!(matches!(
            store.get_identity(&IdentityId::from("busy")).await,
            Err(ClaimsError::Unavailable(_))
        ));
        assert!(matches!(
            store.get_identity(&IdentityId::from("limited")).await,
            Err(ClaimsError::Unavailable(_))
        ));
        assert_eq!(
            store.get_identity(&IdentityId::from("denied")).await,
            Err(ClaimsError::Rejected(403))
        );
    }

    #[tokio::test]
    async fn test_get_identity_invalid_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/identities/u1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let result = store_for(&server).get_identity(&IdentityId::from("u1")).await;
        assert!(matches!(result, Err(ClaimsError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_set_custom_claims_sends_full_map() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/identities/u1/claims"))
            .and(header("authorization", "Bearer svc-token"))
            .and(body_json(json!({"customClaims": {"plan": "pro", "admin": true}})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let claims = json!({"plan": "pro", "admin": true})
            .as_object()
            .cloned()
            .unwrap();
        store_for(&server)
            .set_custom_claims(&IdentityId::from("u1"), claims)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        // Nothing listens on port 9 on loopback in test environments.
        let store = HttpClaimsStore::new("http://127.0.0.1:9", SecretString::from("t")).unwrap();
        let result = store.get_identity(&IdentityId::from("u1")).await;
        assert!(matches!(result, Err(ClaimsError::Unavailable(_))));
    }
}

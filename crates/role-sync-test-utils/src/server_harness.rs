//! Test server harness for E2E testing
//!
//! Provides `TestRoleSyncServer` for spawning real role sync server instances
//! backed by a `MockClaimsStore`.

use crate::fixtures::{sign_body, ROSTER_PATH};
use metrics_exporter_prometheus::PrometheusBuilder;
use role_sync::config::Config;
use role_sync::routes::{self, AppState};
use role_sync::services::claims_store::mock::MockClaimsStore;
use role_sync::services::retry_queue::RetryQueue;
use role_sync::services::trigger::RosterTrigger;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Header carrying the trigger signature.
pub const SIGNATURE_HEADER: &str = "X-Trigger-Signature";

/// Test harness for spawning the role sync server in E2E tests.
///
/// # Example
/// ```rust,ignore
/// let server = TestRoleSyncServer::spawn(MockClaimsStore::new()).await?;
/// let response = reqwest::get(&format!("{}/health", server.url())).await?;
/// assert_eq!(response.status(), 200);
/// ```
pub struct TestRoleSyncServer {
    addr: SocketAddr,
    config: Config,
    store: Arc<MockClaimsStore>,
    retry_queue: Arc<RetryQueue>,
    signing_secret: Option<String>,
    client: reqwest::Client,
    _handle: JoinHandle<()>,
}

impl TestRoleSyncServer {
    /// Spawn a server without signature verification.
    pub async fn spawn(store: MockClaimsStore) -> Result<Self, anyhow::Error> {
        Self::spawn_with(store, None).await
    }

    /// Spawn a server that requires requests signed with `secret`.
    pub async fn spawn_signed(store: MockClaimsStore, secret: &str) -> Result<Self, anyhow::Error> {
        Self::spawn_with(store, Some(secret.to_string())).await
    }

    async fn spawn_with(
        store: MockClaimsStore,
        signing_secret: Option<String>,
    ) -> Result<Self, anyhow::Error> {
        let mut vars = HashMap::from([
            ("BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            ("ROSTER_DOCUMENT_PATH".to_string(), ROSTER_PATH.to_string()),
            (
                "IDENTITY_API_URL".to_string(),
                "http://identity.invalid".to_string(),
            ),
            ("IDENTITY_API_TOKEN".to_string(), "test-token".to_string()),
            ("RECONCILE_IDENTITY_TIMEOUT_MS".to_string(), "2000".to_string()),
            ("RECONCILE_DEADLINE_SECONDS".to_string(), "10".to_string()),
        ]);
        if let Some(secret) = &signing_secret {
            vars.insert("TRIGGER_SIGNING_SECRET".to_string(), secret.clone());
        }

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let store = Arc::new(store);
        let retry_queue = Arc::new(RetryQueue::new());
        let trigger = Arc::new(RosterTrigger::new(
            store.clone(),
            config.roster_document_path.clone(),
            config.reconciler.clone(),
            retry_queue.clone(),
        ));

        let state = Arc::new(AppState {
            config: config.clone(),
            trigger,
            retry_queue: retry_queue.clone(),
        });

        // Recorder is built but not installed; /metrics renders an empty registry
        let metrics_handle = PrometheusBuilder::new().build_recorder().handle();
        let app = routes::build_routes(state, metrics_handle);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            config,
            store,
            retry_queue,
            signing_secret,
            client: reqwest::Client::new(),
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The mock identity directory behind the server.
    pub fn store(&self) -> &MockClaimsStore {
        &self.store
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry_queue
    }

    /// POST `event` to the trigger endpoint, signed when the server requires it.
    pub async fn post_trigger(&self, event: &Value) -> Result<reqwest::Response, anyhow::Error> {
        let body = serde_json::to_vec(event)?;
        let signature = self
            .signing_secret
            .as_deref()
            .map(|secret| sign_body(secret, &body));
        self.post_raw(body, signature).await
    }

    /// POST raw bytes with an optional signature header.
    pub async fn post_raw(
        &self,
        body: Vec<u8>,
        signature: Option<String>,
    ) -> Result<reqwest::Response, anyhow::Error> {
        let mut request = self
            .client
            .post(format!("{}/v1/triggers/roster-updated", self.url()))
            .header("content-type", "application/json")
            .body(body);
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        Ok(request.send().await?)
    }
}

impl Drop for TestRoleSyncServer {
    fn drop(&mut self) {
        self._handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_spawns_successfully() -> Result<(), anyhow::Error> {
        let server = TestRoleSyncServer::spawn(MockClaimsStore::new()).await?;

        assert!(server.url().starts_with("http://127.0.0.1:"));

        let response = reqwest::get(&format!("{}/health", server.url())).await?;
        assert_eq!(response.status(), 200);

        let body: Value = response.json().await?;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["pending_retries"], 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_multiple_servers_different_ports() -> Result<(), anyhow::Error> {
        let server1 = TestRoleSyncServer::spawn(MockClaimsStore::new()).await?;
        let server2 = TestRoleSyncServer::spawn(MockClaimsStore::new()).await?;

        assert_ne!(server1.addr(), server2.addr());
        assert_eq!(server1.config().roster_document_path, ROSTER_PATH);

        Ok(())
    }
}

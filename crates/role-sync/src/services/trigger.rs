//! Roster update trigger.
//!
//! Entry point for document-update events. Filters out records other than
//! the roster singleton, runs a reconciliation pass and hands failures to the
//! retry queue. Passes wait for any running retry pass to finish first.

use crate::models::RosterUpdateEvent;
use crate::observability::metrics::record_pass;
use crate::services::claims_store::ClaimsStore;
use crate::services::reconciler::{reconcile, ReconcileOutcome, ReconcilerConfig, SkipReason};
use crate::services::retry_queue::RetryQueue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

pub struct RosterTrigger {
    store: Arc<dyn ClaimsStore>,
    document_path: String,
    config: ReconcilerConfig,
    retry_queue: Arc<RetryQueue>,
}

impl RosterTrigger {
    pub fn new(
        store: Arc<dyn ClaimsStore>,
        document_path: impl Into<String>,
        config: ReconcilerConfig,
        retry_queue: Arc<RetryQueue>,
    ) -> Self {
        Self {
            store,
            document_path: normalize_path(&document_path.into()).to_string(),
            config,
            retry_queue,
        }
    }

    pub fn document_path(&self) -> &str {
        &self.document_path
    }

    /// Whether `document` names the roster singleton.
    pub fn watches(&self, document: &str) -> bool {
        normalize_path(document) == self.document_path
    }

    /// Handle one document-update event.
    #[instrument(skip_all, name = "role_sync.trigger.handle", fields(document = %event.document))]
    pub async fn handle(&self, event: RosterUpdateEvent) -> ReconcileOutcome {
        if !self.watches(&event.document) {
            debug!(
                target: "role_sync.trigger",
                document = %event.document,
                watched = %self.document_path,
                "Ignoring update to unrelated record"
            );
            record_pass(SkipReason::WrongRecord.label(), Duration::ZERO);
            return ReconcileOutcome::Skipped(SkipReason::WrongRecord);
        }

        info!(
            target: "role_sync.trigger",
            document = %event.document,
            has_before = event.before.is_some(),
            has_after = event.after.is_some(),
            "Roster record updated"
        );

        let _pass = self.retry_queue.exclusive_pass().await;

        let outcome = reconcile(
            event.before.as_ref(),
            event.after.as_ref(),
            self.store.as_ref(),
            &self.config,
        )
        .await;

        if let Some(report) = outcome.report() {
            self.retry_queue.record_report(report).await;
        }

        outcome
    }
}

fn normalize_path(path: &str) -> &str {
    path.trim().trim_matches('/')
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::errors::ClaimsError;
    use crate::models::Roster;
    use crate::services::claims_store::mock::MockClaimsStore;
    use serde_json::json;

    fn trigger(store: Arc<MockClaimsStore>, queue: Arc<RetryQueue>) -> RosterTrigger {
        RosterTrigger::new(store, "config/admins", ReconcilerConfig::default(), queue)
    }

    fn event(document: &str, before: Option<Vec<&str>>, after: Option<Vec<&str>>) -> RosterUpdateEvent {
        RosterUpdateEvent {
            document: document.to_string(),
            before: before.map(Roster::new),
            after: after.map(Roster::new),
        }
    }

    #[tokio::test]
    async fn test_unrelated_record_is_ignored() {
        let store = Arc::new(MockClaimsStore::new().with_identity("u1", json!({})));
        let queue = Arc::new(RetryQueue::new());
        let trigger = trigger(store.clone(), queue);

        let outcome = trigger
            .handle(event("config/features", None, Some(vec!["u1"])))
            .await;

        assert!(matches!(outcome, ReconcileOutcome::Skipped(SkipReason::WrongRecord)));
        assert_eq!(store.call_count(), 0);
    }

    #[tokio::test]
    async fn test_document_path_ignores_surrounding_slashes() {
        let store = Arc::new(MockClaimsStore::new());
        let trigger = trigger(store, Arc::new(RetryQueue::new()));

        assert!(trigger.watches("/config/admins"));
        assert!(trigger.watches("config/admins/"));
        assert!(!trigger.watches("config/admins/extra"));
        assert!(!trigger.watches("Config/Admins"));
    }

    #[tokio::test]
    async fn test_roster_update_is_reconciled() {
        let store = Arc::new(
            MockClaimsStore::new()
                .with_identity("u1", json!({"admin": true}))
                .with_identity("u2", json!({})),
        );
        let trigger = trigger(store.clone(), Arc::new(RetryQueue::new()));

        let outcome = trigger
            .handle(event("config/admins", Some(vec!["u1"]), Some(vec!["u2"])))
            .await;

        let report = outcome.report().expect("pass should complete");
        assert_eq!(report.updated().len(), 2);
        assert_eq!(store.admin_of("u1").await, Some(false));
        assert_eq!(store.admin_of("u2").await, Some(true));
    }

    #[tokio::test]
    async fn test_failures_are_handed_to_retry_queue() {
        let store = Arc::new(
            MockClaimsStore::new()
                .with_identity("u1", json!({}))
                .with_identity("u2", json!({}))
                .failing_write("u2", ClaimsError::Rejected(403)),
        );
        let queue = Arc::new(RetryQueue::new());
        let trigger = trigger(store, queue.clone());

        trigger
            .handle(event("config/admins", None, Some(vec!["u1", "u2"])))
            .await;

        let pending = queue.snapshot().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.first().unwrap().identity_id.as_str(), "u2");
        assert!(pending.first().unwrap().admin);
    }

    #[tokio::test]
    async fn test_deleted_roster_is_noop() {
        let store = Arc::new(MockClaimsStore::new().with_identity("u1", json!({"admin": true})));
        let queue = Arc::new(RetryQueue::new());
        let trigger = trigger(store.clone(), queue.clone());

        let outcome = trigger
            .handle(event("config/admins", Some(vec!["u1"]), None))
            .await;

        assert!(matches!(
            outcome,
            ReconcileOutcome::Skipped(SkipReason::MissingAfterState)
        ));
        assert_eq!(store.call_count(), 0);
        assert!(queue.is_empty().await);
    }
}

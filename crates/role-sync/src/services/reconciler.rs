//! Admin role reconciler.
//!
//! Keeps every identity's `admin` custom claim consistent with membership in
//! the admin roster.
//!
//! # Pass
//!
//! 1. No `after` snapshot: skip (`MissingAfterState`)
//! 2. Compute `added = after - before`, `removed = before - after`
//! 3. Empty delta: skip (`NoChange`), no collaborator calls
//! 4. Fan out one pipeline per changed identity (fetch -> compare -> write),
//!    at most `max_concurrency` at a time
//! 5. Join all pipelines and return a [`ReconciliationReport`]
//!
//! A failing identity never stops its siblings and never fails the pass.
//!
//! # Timeouts and retries
//!
//! - Every attempt of a pipeline is bounded by `identity_timeout`. A timed-out
//!   attempt is a failure and is not retried inline.
//! - `Unavailable` errors are retried up to `max_attempts` total attempts with
//!   exponential backoff. Each attempt re-fetches before writing.
//! - The whole fan-out is bounded by `invocation_deadline`; identities still
//!   running at the deadline are reported as `DeadlineExceeded`.

use crate::errors::ClaimsError;
use crate::models::{admin_claim_matches, with_admin, MembershipDelta, Roster};
use crate::observability::metrics::{
    record_claim_failure, record_identity_outcome, record_pass,
};
use crate::services::claims_store::ClaimsStore;
use chrono::{DateTime, Utc};
use common::types::IdentityId;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default fan-out width.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Default total attempts per identity for transient errors.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default bound on one fetch -> compare -> write attempt.
pub const DEFAULT_IDENTITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on a whole pass.
pub const DEFAULT_INVOCATION_DEADLINE: Duration = Duration::from_secs(60);

/// Base delay for exponential backoff.
pub const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Maximum backoff delay.
pub const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Reconciliation pass settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub max_concurrency: usize,
    pub max_attempts: u32,
    pub identity_timeout: Duration,
    pub invocation_deadline: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            identity_timeout: DEFAULT_IDENTITY_TIMEOUT,
            invocation_deadline: DEFAULT_INVOCATION_DEADLINE,
            backoff_base: BACKOFF_BASE,
            backoff_max: BACKOFF_MAX,
        }
    }
}

/// Why a pass ended without touching any identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The update concerned a record other than the roster singleton.
    WrongRecord,
    /// The record has no state after the update (e.g. deleted).
    MissingAfterState,
    /// Roster membership did not change.
    NoChange,
}

impl SkipReason {
    pub fn label(self) -> &'static str {
        match self {
            SkipReason::WrongRecord => "wrong_record",
            SkipReason::MissingAfterState => "missing_after_state",
            SkipReason::NoChange => "no_change",
        }
    }
}

/// Step of the per-identity pipeline that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Fetch,
    Write,
    /// Still running when the pass deadline expired.
    Pending,
}

impl FailureStage {
    pub fn label(self) -> &'static str {
        match self {
            FailureStage::Fetch => "fetch",
            FailureStage::Write => "write",
            FailureStage::Pending => "pending",
        }
    }
}

/// Result of reconciling one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityOutcome {
    /// Claims were written with the desired admin flag.
    Updated { admin: bool, attempts: u32 },
    /// The admin claim already matched; nothing written.
    AlreadyCorrect { admin: bool },
    /// The identity could not be reconciled in this pass.
    Failed {
        admin: bool,
        stage: FailureStage,
        error: ClaimsError,
        attempts: u32,
    },
}

impl IdentityOutcome {
    /// The admin flag this identity should carry.
    pub fn desired_admin(&self) -> bool {
        match self {
            IdentityOutcome::Updated { admin, .. }
            | IdentityOutcome::AlreadyCorrect { admin }
            | IdentityOutcome::Failed { admin, .. } => *admin,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, IdentityOutcome::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            IdentityOutcome::Updated { .. } => "updated",
            IdentityOutcome::AlreadyCorrect { .. } => "already_correct",
            IdentityOutcome::Failed { .. } => "failed",
        }
    }
}

/// Summary of one completed pass.
#[derive(Debug, Clone)]
pub struct ReconciliationReport {
    pub pass_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub delta: MembershipDelta,
    pub outcomes: BTreeMap<IdentityId, IdentityOutcome>,
}

impl ReconciliationReport {
    fn ids_where(&self, pred: impl Fn(&IdentityOutcome) -> bool) -> Vec<&IdentityId> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| pred(outcome))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn updated(&self) -> Vec<&IdentityId> {
        self.ids_where(|o| matches!(o, IdentityOutcome::Updated { .. }))
    }

    pub fn already_correct(&self) -> Vec<&IdentityId> {
        self.ids_where(|o| matches!(o, IdentityOutcome::AlreadyCorrect { .. }))
    }

    pub fn failed(&self) -> Vec<&IdentityId> {
        self.ids_where(IdentityOutcome::is_failed)
    }

    /// Number of successful claim writes.
    pub fn writes_issued(&self) -> usize {
        self.updated().len()
    }
}

/// Result of [`reconcile`].
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    Skipped(SkipReason),
    Completed(ReconciliationReport),
}

impl ReconcileOutcome {
    pub fn report(&self) -> Option<&ReconciliationReport> {
        match self {
            ReconcileOutcome::Completed(report) => Some(report),
            ReconcileOutcome::Skipped(_) => None,
        }
    }
}

/// Reconcile admin claims for one roster update.
///
/// Never fails: collaborator errors are recorded per identity in the report.
#[instrument(skip_all, name = "role_sync.reconcile")]
pub async fn reconcile(
    before: Option<&Roster>,
    after: Option<&Roster>,
    store: &dyn ClaimsStore,
    config: &ReconcilerConfig,
) -> ReconcileOutcome {
    let started = Instant::now();

    let Some(after) = after else {
        debug!(target: "role_sync.reconciler", "No after-state, nothing to reconcile");
        record_pass(SkipReason::MissingAfterState.label(), started.elapsed());
        return ReconcileOutcome::Skipped(SkipReason::MissingAfterState);
    };

    let delta = MembershipDelta::between(before, after);
    if delta.is_empty() {
        debug!(target: "role_sync.reconciler", "Roster membership unchanged, no claim writes");
        record_pass(SkipReason::NoChange.label(), started.elapsed());
        return ReconcileOutcome::Skipped(SkipReason::NoChange);
    }

    let pass_id = Uuid::new_v4();
    let started_at = Utc::now();

    info!(
        target: "role_sync.reconciler",
        pass_id = %pass_id,
        added = ?delta.added,
        removed = ?delta.removed,
        "Reconciling admin claims"
    );

    let outcomes = fan_out(&delta, store, config, pass_id).await;

    let report = ReconciliationReport {
        pass_id,
        started_at,
        delta,
        outcomes,
    };

    info!(
        target: "role_sync.reconciler",
        pass_id = %pass_id,
        updated = report.updated().len(),
        already_correct = report.already_correct().len(),
        failed = report.failed().len(),
        "Reconciliation pass complete"
    );
    record_pass("completed", started.elapsed());

    ReconcileOutcome::Completed(report)
}

/// Run every changed identity's pipeline and join them under the pass deadline.
async fn fan_out(
    delta: &MembershipDelta,
    store: &dyn ClaimsStore,
    config: &ReconcilerConfig,
    pass_id: Uuid,
) -> BTreeMap<IdentityId, IdentityOutcome> {
    let deadline = tokio::time::Instant::now() + config.invocation_deadline;

    let mut pending: BTreeMap<IdentityId, bool> = delta
        .changed()
        .map(|(id, admin)| (id.clone(), admin))
        .collect();
    let mut outcomes = BTreeMap::new();

    let work: Vec<(IdentityId, bool)> = pending
        .iter()
        .map(|(id, admin)| (id.clone(), *admin))
        .collect();

    let mut results = std::pin::pin!(stream::iter(work)
        .map(move |(id, desired)| async move {
            let outcome = apply_admin_claim(store, &id, desired, config).await;
            (id, outcome)
        })
        .buffer_unordered(config.max_concurrency.max(1)));

    loop {
        match tokio::time::timeout_at(deadline, results.next()).await {
            Ok(Some((id, outcome))) => {
                log_outcome(pass_id, &id, &outcome);
                pending.remove(&id);
                outcomes.insert(id, outcome);
            }
            Ok(None) => break,
            Err(_) => {
                warn!(
                    target: "role_sync.reconciler",
                    pass_id = %pass_id,
                    unfinished = pending.len(),
                    deadline_secs = config.invocation_deadline.as_secs_f64(),
                    "Reconciliation deadline exceeded"
                );
                break;
            }
        }
    }

    for (id, admin) in pending {
        let outcome = IdentityOutcome::Failed {
            admin,
            stage: FailureStage::Pending,
            error: ClaimsError::DeadlineExceeded,
            attempts: 0,
        };
        log_outcome(pass_id, &id, &outcome);
        outcomes.insert(id, outcome);
    }

    outcomes
}

fn log_outcome(pass_id: Uuid, id: &IdentityId, outcome: &IdentityOutcome) {
    record_identity_outcome(outcome.label());

    match outcome {
        IdentityOutcome::Updated { admin, attempts } => info!(
            target: "role_sync.reconciler",
            pass_id = %pass_id,
            identity_id = %id,
            desired_admin = admin,
            attempts = attempts,
            "Admin claim updated"
        ),
        IdentityOutcome::AlreadyCorrect { admin } => info!(
            target: "role_sync.reconciler",
            pass_id = %pass_id,
            identity_id = %id,
            desired_admin = admin,
            "Admin claim already correct, skipping write"
        ),
        IdentityOutcome::Failed {
            admin,
            stage,
            error,
            attempts,
        } => {
            record_claim_failure(stage.label(), error.label());
            warn!(
                target: "role_sync.reconciler",
                pass_id = %pass_id,
                identity_id = %id,
                desired_admin = admin,
                stage = stage.label(),
                attempts = attempts,
                error = %error,
                "Failed to reconcile admin claim"
            );
        }
    }
}

/// Bring one identity's admin claim to `desired`.
///
/// Fetch -> compare -> write, retried with backoff on transient errors.
pub async fn apply_admin_claim(
    store: &dyn ClaimsStore,
    id: &IdentityId,
    desired: bool,
    config: &ReconcilerConfig,
) -> IdentityOutcome {
    let max_attempts = config.max_attempts.max(1);
    let mut attempts = 0;
    let mut delay = config.backoff_base;

    loop {
        attempts += 1;
        let mut stage = FailureStage::Fetch;

        let attempt = sync_once(store, id, desired, &mut stage);
        let result = match tokio::time::timeout(config.identity_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ClaimsError::Timeout),
        };

        match result {
            Ok(true) => return IdentityOutcome::Updated {
                admin: desired,
                attempts,
            },
            Ok(false) => return IdentityOutcome::AlreadyCorrect { admin: desired },
            Err(error) if error.is_transient() && attempts < max_attempts => {
                debug!(
                    target: "role_sync.reconciler",
                    identity_id = %id,
                    stage = stage.label(),
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient identity service error, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(config.backoff_max);
            }
            Err(error) => {
                return IdentityOutcome::Failed {
                    admin: desired,
                    stage,
                    error,
                    attempts,
                }
            }
        }
    }
}

/// One fetch -> compare -> write attempt. Returns whether a write happened.
///
/// `stage` tracks the step in flight so a timeout can be attributed.
async fn sync_once(
    store: &dyn ClaimsStore,
    id: &IdentityId,
    desired: bool,
    stage: &mut FailureStage,
) -> Result<bool, ClaimsError> {
    *stage = FailureStage::Fetch;
    let record = store.get_identity(id).await?;

    if admin_claim_matches(&record.custom_claims, desired) {
        return Ok(false);
    }

    *stage = FailureStage::Write;
    store
        .set_custom_claims(id, with_admin(record.custom_claims, desired))
        .await?;
    Ok(true)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::services::claims_store::mock::MockClaimsStore;
    use serde_json::json;

    fn id(value: &str) -> IdentityId {
        IdentityId::from(value)
    }

    fn fast_config() -> ReconcilerConfig {
        ReconcilerConfig {
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
            ..ReconcilerConfig::default()
        }
    }

    async fn completed(
        before: Option<&Roster>,
        after: Option<&Roster>,
        store: &MockClaimsStore,
        config: &ReconcilerConfig,
    ) -> ReconciliationReport {
        match reconcile(before, after, store, config).await {
            ReconcileOutcome::Completed(report) => report,
            ReconcileOutcome::Skipped(reason) => panic!("expected a completed pass, got {reason:?}"),
        }
    }

    #[test]
    fn test_backoff_constants() {
        assert_eq!(BACKOFF_BASE, Duration::from_millis(200));
        assert_eq!(BACKOFF_MAX, Duration::from_secs(5));
        assert_eq!(ReconcilerConfig::default().max_attempts, 3);
    }

    #[tokio::test]
    async fn test_swap_one_admin() {
        let store = MockClaimsStore::new()
            .with_identity("u1", json!({"admin": true}))
            .with_identity("u2", json!({"admin": true}))
            .with_identity("u3", json!({}));

        let report = completed(
            Some(&Roster::new(["u1", "u2"])),
            Some(&Roster::new(["u1", "u3"])),
            &store,
            &fast_config(),
        )
        .await;

        assert_eq!(report.outcomes.len(), 2);
        assert!(!report.outcomes.contains_key(&id("u1")));
        assert_eq!(store.admin_of("u3").await, Some(true));
        assert_eq!(store.admin_of("u2").await, Some(false));
        assert_eq!(store.admin_of("u1").await, Some(true));
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_unchanged_roster_is_noop() {
        let store = MockClaimsStore::new().with_identity("u1", json!({"admin": true}));
        let roster = Roster::new(["u1"]);

        let outcome = reconcile(Some(&roster), Some(&roster), &store, &fast_config()).await;

        assert!(matches!(outcome, ReconcileOutcome::Skipped(SkipReason::NoChange)));
        assert_eq!(store.call_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_before_adds_everyone() {
        let store = MockClaimsStore::new().with_identity("u5", json!({}));

        let report = completed(None, Some(&Roster::new(["u5"])), &store, &fast_config()).await;

        assert_eq!(
            report.outcomes[&id("u5")],
            IdentityOutcome::Updated {
                admin: true,
                attempts: 1
            }
        );
        assert_eq!(store.admin_of("u5").await, Some(true));
    }

    #[tokio::test]
    async fn test_missing_after_is_noop() {
        let store = MockClaimsStore::new().with_identity("u1", json!({"admin": true}));

        let outcome = reconcile(Some(&Roster::new(["u1"])), None, &store, &fast_config()).await;

        assert!(matches!(
            outcome,
            ReconcileOutcome::Skipped(SkipReason::MissingAfterState)
        ));
        assert_eq!(store.call_count(), 0);
    }

    #[tokio::test]
    async fn test_removal_preserves_other_claims() {
        let store = MockClaimsStore::new().with_identity("u1", json!({"admin": true, "plan": "pro"}));

        completed(
            Some(&Roster::new(["u1"])),
            Some(&Roster::new(Vec::<String>::new())),
            &store,
            &fast_config(),
        )
        .await;

        let claims = store.claims_of("u1").await.unwrap();
        assert_eq!(
            serde_json::Value::Object(claims),
            json!({"admin": false, "plan": "pro"})
        );
    }

    #[tokio::test]
    async fn test_already_correct_claim_is_not_written() {
        let store = MockClaimsStore::new()
            .with_identity("u1", json!({"admin": true}))
            .with_identity("u2", json!({"plan": "free"}));

        let report = completed(
            Some(&Roster::new(["u2"])),
            Some(&Roster::new(["u1"])),
            &store,
            &fast_config(),
        )
        .await;

        assert_eq!(
            report.outcomes[&id("u1")],
            IdentityOutcome::AlreadyCorrect { admin: true }
        );
        assert_eq!(
            report.outcomes[&id("u2")],
            IdentityOutcome::AlreadyCorrect { admin: false }
        );
        assert_eq!(store.write_count(), 0);
        assert_eq!(report.writes_issued(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_isolated() {
        let store = MockClaimsStore::new()
            .with_identity("a", json!({}))
            .with_identity("b", json!({}))
            .with_identity("c", json!({}))
            .failing_fetch("b", ClaimsError::NotFound);

        let report = completed(None, Some(&Roster::new(["a", "b", "c"])), &store, &fast_config()).await;

        assert_eq!(store.admin_of("a").await, Some(true));
        assert_eq!(store.admin_of("c").await, Some(true));
        assert_eq!(report.failed(), vec![&id("b")]);
        assert!(matches!(
            report.outcomes[&id("b")],
            IdentityOutcome::Failed {
                stage: FailureStage::Fetch,
                error: ClaimsError::NotFound,
                attempts: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_write_failure_is_isolated() {
        let store = MockClaimsStore::new()
            .with_identity("a", json!({}))
            .with_identity("b", json!({}))
            .failing_write("a", ClaimsError::Rejected(403));

        let report = completed(None, Some(&Roster::new(["a", "b"])), &store, &fast_config()).await;

        assert_eq!(store.admin_of("b").await, Some(true));
        assert_eq!(store.admin_of("a").await, None);
        assert!(matches!(
            report.outcomes[&id("a")],
            IdentityOutcome::Failed {
                stage: FailureStage::Write,
                error: ClaimsError::Rejected(403),
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let store = MockClaimsStore::new()
            .with_identity("u1", json!({}))
            .failing_fetch_times("u1", ClaimsError::Unavailable("503".to_string()), 2);

        let outcome = apply_admin_claim(&store, &id("u1"), true, &fast_config()).await;

        assert_eq!(
            outcome,
            IdentityOutcome::Updated {
                admin: true,
                attempts: 3
            }
        );
        assert_eq!(store.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_give_up_after_max_attempts() {
        let store = MockClaimsStore::new()
            .with_identity("u1", json!({}))
            .failing_write("u1", ClaimsError::Unavailable("503".to_string()));

        let outcome = apply_admin_claim(&store, &id("u1"), true, &fast_config()).await;

        assert!(matches!(
            outcome,
            IdentityOutcome::Failed {
                stage: FailureStage::Write,
                error: ClaimsError::Unavailable(_),
                attempts: 3,
                ..
            }
        ));
        // Every retry re-fetches before writing.
        assert_eq!(store.fetch_count(), 3);
        assert_eq!(store.write_count(), 3);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let store = MockClaimsStore::new();

        let outcome = apply_admin_claim(&store, &id("ghost"), true, &fast_config()).await;

        assert!(matches!(
            outcome,
            IdentityOutcome::Failed {
                error: ClaimsError::NotFound,
                attempts: 1,
                ..
            }
        ));
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_identity_times_out_without_retry() {
        let store = MockClaimsStore::new()
            .with_identity("slow", json!({}))
            .with_identity("fast", json!({}))
            .with_fetch_delay("slow", Duration::from_secs(30));
        let config = ReconcilerConfig {
            identity_timeout: Duration::from_secs(1),
            ..fast_config()
        };

        let report = completed(None, Some(&Roster::new(["slow", "fast"])), &store, &config).await;

        assert_eq!(
            report.outcomes[&id("slow")],
            IdentityOutcome::Failed {
                admin: true,
                stage: FailureStage::Fetch,
                error: ClaimsError::Timeout,
                attempts: 1
            }
        );
        assert_eq!(store.admin_of("fast").await, Some(true));
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_deadline_marks_unfinished_identities() {
        let store = MockClaimsStore::new()
            .with_identity("slow", json!({}))
            .with_identity("fast", json!({}))
            .with_fetch_delay("slow", Duration::from_secs(30));
        let config = ReconcilerConfig {
            identity_timeout: Duration::from_secs(60),
            invocation_deadline: Duration::from_secs(2),
            ..fast_config()
        };

        let report = completed(None, Some(&Roster::new(["slow", "fast"])), &store, &config).await;

        assert_eq!(
            report.outcomes[&id("slow")],
            IdentityOutcome::Failed {
                admin: true,
                stage: FailureStage::Pending,
                error: ClaimsError::DeadlineExceeded,
                attempts: 0
            }
        );
        assert!(matches!(
            report.outcomes[&id("fast")],
            IdentityOutcome::Updated { .. }
        ));
    }

    #[tokio::test]
    async fn test_fan_out_respects_concurrency_bound() {
        let mut store = MockClaimsStore::new();
        let ids: Vec<String> = (0..20).map(|i| format!("u{i}")).collect();
        for id in &ids {
            store = store.with_identity(id, json!({}));
        }
        let config = ReconcilerConfig {
            max_concurrency: 3,
            ..fast_config()
        };

        let report = completed(None, Some(&Roster::new(ids.clone())), &store, &config).await;

        assert_eq!(report.updated().len(), 20);
        assert!(store.max_in_flight() <= 3);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(
            IdentityOutcome::Updated {
                admin: true,
                attempts: 1
            }
            .label(),
            "updated"
        );
        assert_eq!(
            IdentityOutcome::AlreadyCorrect { admin: false }.label(),
            "already_correct"
        );
        assert_eq!(SkipReason::WrongRecord.label(), "wrong_record");
        assert_eq!(FailureStage::Pending.label(), "pending");
    }
}

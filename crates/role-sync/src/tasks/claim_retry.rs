//! Claim retry background task.
//!
//! Periodically re-applies the desired admin flag to identities left in the
//! [`RetryQueue`] by failed reconciliation passes.
//!
//! # Graceful Shutdown
//!
//! The task exits when its cancellation token fires. A retry pass already in
//! progress is finished first.

use crate::observability::metrics::record_retry_attempt;
use crate::services::claims_store::ClaimsStore;
use crate::services::reconciler::{apply_admin_claim, IdentityOutcome, ReconcilerConfig};
use crate::services::retry_queue::{BumpResult, RetryConfig, RetryQueue};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Tally of one retry pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryPassSummary {
    pub resolved: usize,
    pub requeued: usize,
    pub abandoned: usize,
    pub superseded: usize,
    /// Left queued because the pass ran out of time.
    pub deferred: usize,
}

/// Run the retry loop until `cancel_token` fires.
///
/// The first pass runs one `interval` after start.
pub async fn start_claim_retry(
    store: Arc<dyn ClaimsStore>,
    queue: Arc<RetryQueue>,
    reconciler: ReconcilerConfig,
    retry: RetryConfig,
    cancel_token: CancellationToken,
) {
    info!(
        target: "role_sync.task.claim_retry",
        interval_secs = retry.interval.as_secs(),
        max_passes = retry.max_passes,
        "Claim retry task started"
    );

    let start = tokio::time::Instant::now() + retry.interval;
    let mut interval = tokio::time::interval_at(start, retry.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if queue.is_empty().await {
                    continue;
                }
                let summary = run_retry_pass(store.as_ref(), &queue, &reconciler, retry.max_passes).await;
                info!(
                    target: "role_sync.task.claim_retry",
                    resolved = summary.resolved,
                    requeued = summary.requeued,
                    abandoned = summary.abandoned,
                    superseded = summary.superseded,
                    deferred = summary.deferred,
                    "Claim retry pass complete"
                );
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "role_sync.task.claim_retry",
                    "Claim retry task received shutdown signal, exiting"
                );
                break;
            }
        }
    }
}

/// Attempt every pending identity once.
///
/// Holds the queue's pass slot throughout, so no trigger pass runs in between
/// the snapshot and the last write. Identities still in flight when the
/// reconciliation deadline passes stay queued untouched.
#[instrument(skip_all, name = "role_sync.task.claim_retry.pass")]
pub async fn run_retry_pass(
    store: &dyn ClaimsStore,
    queue: &RetryQueue,
    config: &ReconcilerConfig,
    max_passes: u32,
) -> RetryPassSummary {
    let _pass = queue.exclusive_pass().await;
    let deadline = tokio::time::Instant::now() + config.invocation_deadline;
    let pending = queue.snapshot().await;
    let total = pending.len();

    let mut attempts = std::pin::pin!(stream::iter(pending)
        .map(move |claim| async move {
            // Skip entries a pass cleared or replaced after the snapshot
            if !queue.is_current(&claim.identity_id, claim.generation).await {
                return (claim, None);
            }
            let outcome = apply_admin_claim(store, &claim.identity_id, claim.admin, config).await;
            (claim, Some(outcome))
        })
        .buffer_unordered(config.max_concurrency.max(1)));

    let mut results = Vec::with_capacity(total);
    loop {
        match tokio::time::timeout_at(deadline, attempts.next()).await {
            Ok(Some(result)) => results.push(result),
            Ok(None) => break,
            Err(_) => {
                warn!(
                    target: "role_sync.task.claim_retry",
                    unfinished = total - results.len(),
                    deadline_secs = config.invocation_deadline.as_secs_f64(),
                    "Retry pass deadline exceeded"
                );
                break;
            }
        }
    }

    let mut summary = RetryPassSummary {
        deferred: total - results.len(),
        ..RetryPassSummary::default()
    };

    for (claim, outcome) in results {
        let id = &claim.identity_id;
        let Some(outcome) = outcome else {
            debug!(
                target: "role_sync.task.claim_retry",
                identity_id = %id,
                "Retry superseded by a newer pass"
            );
            record_retry_attempt("superseded");
            summary.superseded += 1;
            continue;
        };
        match outcome {
            IdentityOutcome::Updated { .. } | IdentityOutcome::AlreadyCorrect { .. } => {
                if queue.resolve(id, claim.generation).await {
                    info!(
                        target: "role_sync.task.claim_retry",
                        identity_id = %id,
                        desired_admin = claim.admin,
                        outcome = outcome.label(),
                        "Admin claim repaired on retry"
                    );
                    record_retry_attempt("resolved");
                    summary.resolved += 1;
                } else {
                    debug!(
                        target: "role_sync.task.claim_retry",
                        identity_id = %id,
                        "Retry superseded by a newer pass"
                    );
                    record_retry_attempt("superseded");
                    summary.superseded += 1;
                }
            }
            IdentityOutcome::Failed { error, stage, .. } => {
                match queue.bump(id, claim.generation, error.clone(), max_passes).await {
                    BumpResult::Requeued { retry_passes } => {
                        warn!(
                            target: "role_sync.task.claim_retry",
                            identity_id = %id,
                            desired_admin = claim.admin,
                            stage = stage.label(),
                            retry_passes = retry_passes,
                            error = %error,
                            "Admin claim retry failed, will try again"
                        );
                        record_retry_attempt("requeued");
                        summary.requeued += 1;
                    }
                    BumpResult::Abandoned => {
                        record_retry_attempt("abandoned");
                        summary.abandoned += 1;
                    }
                    BumpResult::Superseded => {
                        record_retry_attempt("superseded");
                        summary.superseded += 1;
                    }
                }
            }
        }
    }

    summary
}

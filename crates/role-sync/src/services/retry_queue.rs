//! Follow-up retry queue for identities a reconciliation pass could not fix.
//!
//! A roster may never change again after a failed claim write, so failed
//! identities are remembered here with the admin flag they should carry and
//! re-attempted by the `claim_retry` task.
//!
//! # Ordering
//!
//! The newest reconciliation pass always wins. Every entry carries a
//! generation; [`RetryQueue::resolve`] and [`RetryQueue::bump`] only act on the
//! generation they were handed, so a retry that raced with a newer pass
//! cannot drop or overwrite the newer desired state.
//!
//! Passes never overlap. Trigger passes and retry passes both hold
//! [`RetryQueue::exclusive_pass`] from their first fetch until their results
//! are folded back into the queue, so a retry cannot write a flag a newer
//! pass has already reversed.

use crate::errors::ClaimsError;
use crate::observability::metrics::set_pending_retries;
use crate::services::reconciler::{IdentityOutcome, ReconciliationReport};
use common::types::IdentityId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error};

/// Default interval between retry passes.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of retry passes before an identity is abandoned.
pub const DEFAULT_MAX_RETRY_PASSES: u32 = 10;

/// Follow-up retry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Time between retry passes.
    pub interval: Duration,
    /// Retry passes per identity before giving up.
    pub max_passes: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            max_passes: DEFAULT_MAX_RETRY_PASSES,
        }
    }
}

/// An identity waiting for a follow-up attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingClaim {
    pub identity_id: IdentityId,
    pub admin: bool,
    pub generation: u64,
    pub retry_passes: u32,
    pub last_error: ClaimsError,
}

/// Result of [`RetryQueue::bump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpResult {
    /// Still queued after `retry_passes` failed passes.
    Requeued { retry_passes: u32 },
    /// Dropped after reaching the pass limit.
    Abandoned,
    /// A newer pass replaced or cleared the entry; nothing changed.
    Superseded,
}

#[derive(Debug)]
struct Entry {
    admin: bool,
    generation: u64,
    retry_passes: u32,
    last_error: ClaimsError,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<IdentityId, Entry>,
    next_generation: u64,
}

impl QueueState {
    fn publish_len(&self) {
        set_pending_retries(self.entries.len());
    }
}

#[derive(Debug, Default)]
pub struct RetryQueue {
    state: Mutex<QueueState>,
    pass_lock: Mutex<()>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other pass is running and claim the pass slot.
    ///
    /// Held for the whole of a trigger pass or a retry pass.
    pub async fn exclusive_pass(&self) -> MutexGuard<'_, ()> {
        self.pass_lock.lock().await
    }

    /// Whether `id` is still queued at `generation`.
    pub async fn is_current(&self, id: &IdentityId, generation: u64) -> bool {
        let state = self.state.lock().await;
        state.entries.get(id).map(|entry| entry.generation) == Some(generation)
    }

    /// Fold a pass into the queue: failures are (re)queued, everything else cleared.
    pub async fn record_report(&self, report: &ReconciliationReport) {
        let mut state = self.state.lock().await;

        for (id, outcome) in &report.outcomes {
            match outcome {
                IdentityOutcome::Failed { admin, error, .. } => {
                    state.next_generation += 1;
                    let generation = state.next_generation;
                    state.entries.insert(
                        id.clone(),
                        Entry {
                            admin: *admin,
                            generation,
                            retry_passes: 0,
                            last_error: error.clone(),
                        },
                    );
                    debug!(
                        target: "role_sync.retry_queue",
                        identity_id = %id,
                        desired_admin = admin,
                        "Queued identity for follow-up retry"
                    );
                }
                IdentityOutcome::Updated { .. } | IdentityOutcome::AlreadyCorrect { .. } => {
                    state.entries.remove(id);
                }
            }
        }

        state.publish_len();
    }

    /// Entries currently waiting, ordered by id.
    pub async fn snapshot(&self) -> Vec<PendingClaim> {
        let state = self.state.lock().await;
        let mut pending: Vec<PendingClaim> = state
            .entries
            .iter()
            .map(|(id, entry)| PendingClaim {
                identity_id: id.clone(),
                admin: entry.admin,
                generation: entry.generation,
                retry_passes: entry.retry_passes,
                last_error: entry.last_error.clone(),
            })
            .collect();
        pending.sort_by(|a, b| a.identity_id.cmp(&b.identity_id));
        pending
    }

    /// Remove `id` if it is still at `generation`. Returns whether it was removed.
    pub async fn resolve(&self, id: &IdentityId, generation: u64) -> bool {
        let mut state = self.state.lock().await;
        let current = state.entries.get(id).map(|entry| entry.generation);
        if current != Some(generation) {
            return false;
        }
        state.entries.remove(id);
        state.publish_len();
        true
    }

    /// Count one more failed retry pass for `id` at `generation`.
    pub async fn bump(
        &self,
        id: &IdentityId,
        generation: u64,
        last_error: ClaimsError,
        max_passes: u32,
    ) -> BumpResult {
        let mut state = self.state.lock().await;

        let Some(entry) = state.entries.get_mut(id) else {
            return BumpResult::Superseded;
        };
        if entry.generation != generation {
            return BumpResult::Superseded;
        }

        entry.retry_passes += 1;
        entry.last_error = last_error;

        if entry.retry_passes < max_passes {
            return BumpResult::Requeued {
                retry_passes: entry.retry_passes,
            };
        }

        error!(
            target: "role_sync.retry_queue",
            identity_id = %id,
            desired_admin = entry.admin,
            retry_passes = entry.retry_passes,
            error = %entry.last_error,
            "Giving up on admin claim; identity needs manual repair"
        );
        state.entries.remove(id);
        state.publish_len();
        BumpResult::Abandoned
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

//! Service layer for the role sync service.
//!
//! - `claims_store` - identity claims collaborator (HTTP client and in-memory mock)
//! - `reconciler` - roster delta computation and per-identity claim pipeline
//! - `retry_queue` - identities awaiting a follow-up claim write
//! - `trigger` - document-update entry point

pub mod claims_store;
pub mod reconciler;
pub mod retry_queue;
pub mod trigger;

pub use claims_store::{ClaimsStore, HttpClaimsStore, IdentityRecord};
pub use reconciler::{reconcile, ReconcileOutcome, ReconcilerConfig, ReconciliationReport};
pub use retry_queue::{RetryConfig, RetryQueue};
pub use trigger::RosterTrigger;

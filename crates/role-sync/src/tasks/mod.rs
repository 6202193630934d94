//! Background tasks for the role sync service.
//!
//! - `claim_retry` - re-applies admin claims that failed during a reconciliation pass

pub mod claim_retry;

pub use claim_retry::{run_retry_pass, start_claim_retry, RetryPassSummary};

//! Role Sync Service Library
//!
//! Keeps the `admin` custom claim of every identity consistent with the
//! admin roster document. Each update of the roster record triggers a
//! reconciliation pass over the identities whose membership changed.
//!
//! # Architecture
//!
//! ```text
//! routes/mod.rs -> handlers/*.rs -> services/trigger.rs -> services/reconciler.rs -> ClaimsStore
//!                                                       \-> services/retry_queue.rs <- tasks/claim_retry.rs
//! ```
//!
//! # Modules
//!
//! - `config` - Service configuration from environment
//! - `errors` - Collaborator and HTTP error types
//! - `handlers` - HTTP request handlers
//! - `middleware` - HTTP metrics middleware
//! - `models` - Roster, membership delta and claim helpers
//! - `observability` - Metrics definitions
//! - `routes` - Axum router setup
//! - `services` - Reconciler, identity claims collaborator, retry queue
//! - `tasks` - Background claim retry

pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod routes;
pub mod services;
pub mod tasks;

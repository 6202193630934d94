//! Observability for the role sync service.
//!
//! Metric definitions and recording helpers. Logging is set up by
//! `common::telemetry`.

pub mod metrics;

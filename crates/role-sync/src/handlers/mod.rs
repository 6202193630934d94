//! HTTP request handlers for the role sync service.

pub mod health;
pub mod metrics;
pub mod trigger;

pub use health::health_check;
pub use metrics::metrics_handler;
pub use trigger::roster_updated;

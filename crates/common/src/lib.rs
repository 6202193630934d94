//! Common utilities and types shared across role sync components.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;

/// Module for common configuration
pub mod config;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for tracing subscriber initialization
pub mod telemetry;

//! # Role Sync Test Utilities
//!
//! Shared test utilities for the role sync service.
//!
//! This crate provides:
//! - Trigger payload fixtures and request signing (`fixtures`)
//! - Server test harness (`TestRoleSyncServer` for E2E tests)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use role_sync::services::claims_store::mock::MockClaimsStore;
//! use role_sync_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let store = MockClaimsStore::new().with_identity("u1", json!({}));
//!     let server = TestRoleSyncServer::spawn(store).await?;
//!
//!     let response = server
//!         .post_trigger(&roster_event(ROSTER_PATH, None, Some(&["u1"])))
//!         .await?;
//!
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod server_harness;

pub use fixtures::*;
pub use server_harness::*;

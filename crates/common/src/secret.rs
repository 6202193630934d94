//! Secret types for credentials that must never reach the logs.
//!
//! Re-exports [`secrecy`] types. The identity service bearer token and the
//! trigger signing secret are both held as [`SecretString`], so any struct
//! deriving `Debug` around them prints a redacted placeholder instead of the
//! value.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct IdentityApiCredentials {
//!     base_url: String,
//!     token: SecretString,
//! }
//!
//! let creds = IdentityApiCredentials {
//!     base_url: "https://identity.internal".to_string(),
//!     token: SecretString::from("svc-token"),
//! };
//!
//! assert!(!format!("{creds:?}").contains("svc-token"));
//! assert_eq!(creds.token.expose_secret(), "svc-token");
//! ```
//!
//! Only call `expose_secret()` at the point the value leaves the process
//! (an `Authorization` header, an HMAC key).

pub use secrecy::{ExposeSecret, SecretString};

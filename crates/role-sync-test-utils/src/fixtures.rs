//! Trigger payload fixtures.

use ring::hmac;
use serde_json::{json, Value};

/// Roster document path used by the test harness.
pub const ROSTER_PATH: &str = "config/admins";

/// Build a roster document snapshot.
pub fn roster(ids: &[&str]) -> Value {
    json!({ "adminIds": ids })
}

/// Build a roster update event. `None` omits the snapshot.
pub fn roster_event(document: &str, before: Option<&[&str]>, after: Option<&[&str]>) -> Value {
    let mut event = json!({ "document": document });
    if let Some(ids) = before {
        event["before"] = roster(ids);
    }
    if let Some(ids) = after {
        event["after"] = roster(ids);
    }
    event
}

/// Hex HMAC-SHA256 of `body` under `secret`, as sent in `X-Trigger-Signature`.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hex::encode(hmac::sign(&key, body).as_ref())
}

//! Data models for role sync.
//!
//! - [`Roster`] - the admin roster record as delivered by the trigger
//! - [`RosterUpdateEvent`] - before/after snapshots of one record update
//! - [`MembershipDelta`] - identities added to / removed from the roster
//! - [`Claims`] - an identity's custom claims map

use common::types::IdentityId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Name of the custom claim this service owns.
pub const ADMIN_CLAIM: &str = "admin";

/// Custom claims of one identity.
pub type Claims = Map<String, Value>;

/// Snapshot of the admin roster record.
///
/// Persisted as a list, treated as a set: duplicates collapse and order is
/// irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Roster {
    #[serde(default)]
    pub admin_ids: Vec<IdentityId>,
}

impl Roster {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<IdentityId>,
    {
        Self {
            admin_ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Logical membership: deduplicated, blank ids dropped.
    pub fn members(&self) -> BTreeSet<IdentityId> {
        self.admin_ids
            .iter()
            .filter(|id| !id.is_blank())
            .cloned()
            .collect()
    }
}

/// Record update delivered by the document-change trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterUpdateEvent {
    /// Path of the updated record, e.g. `config/admins`.
    pub document: String,
    #[serde(default)]
    pub before: Option<Roster>,
    #[serde(default)]
    pub after: Option<Roster>,
}

/// Identities whose admin status changed between two roster snapshots.
///
/// `added` and `removed` are always disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MembershipDelta {
    pub added: BTreeSet<IdentityId>,
    pub removed: BTreeSet<IdentityId>,
}

impl MembershipDelta {
    /// Compute `after - before` and `before - after`.
    ///
    /// A missing `before` snapshot is an empty roster.
    pub fn between(before: Option<&Roster>, after: &Roster) -> Self {
        let before = before.map(Roster::members).unwrap_or_default();
        let after = after.members();

        Self {
            added: after.difference(&before).cloned().collect(),
            removed: before.difference(&after).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Number of identities to reconcile.
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len()
    }

    /// Every changed identity paired with its desired admin flag.
    pub fn changed(&self) -> impl Iterator<Item = (&IdentityId, bool)> {
        self.added
            .iter()
            .map(|id| (id, true))
            .chain(self.removed.iter().map(|id| (id, false)))
    }
}

/// True if `claims` already carries the desired admin flag.
///
/// A missing claim counts as `false`. A non-boolean value never matches.
pub fn admin_claim_matches(claims: &Claims, desired: bool) -> bool {
    match claims.get(ADMIN_CLAIM) {
        None => !desired,
        Some(value) => value.as_bool() == Some(desired),
    }
}

/// `claims` with only the admin flag replaced.
pub fn with_admin(mut claims: Claims, desired: bool) -> Claims {
    claims.insert(ADMIN_CLAIM.to_string(), Value::Bool(desired));
    claims
}

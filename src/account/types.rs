//! Account record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::assertion::AuthHash;

/// Whether an account may authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    Active,
    Blocked,
}

/// A (provider, uid) pair linking an account to a federated identity
/// source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalIdentity {
    pub provider: String,
    pub uid: String,
}

impl ExternalIdentity {
    pub fn new(provider: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            uid: uid.into(),
        }
    }
}

impl std::fmt::Display for ExternalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.uid)
    }
}

/// Local identity record.
///
/// The resolver reads and proposes mutations; only the account store
/// assigns ids and commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Store-assigned UUID, `None` until the first commit.
    pub id: Option<String>,

    /// Linked federated identities.
    pub external_identities: BTreeSet<ExternalIdentity>,

    /// Primary email address. May be empty for email-less assertions.
    pub email: String,

    /// Display name.
    pub name: String,

    /// Marked external via group policy.
    pub is_external: bool,

    /// Granted the admin flag via group policy.
    pub is_admin: bool,

    /// Block state.
    pub block_state: BlockState,

    /// Creation time (first built, not first committed).
    pub created_at: DateTime<Utc>,

    /// Last commit time, maintained by the store.
    pub last_modified: DateTime<Utc>,
}

impl Account {
    /// Build a not-yet-persisted account seeded from an assertion.
    pub fn build_from(auth: &AuthHash) -> Self {
        let now = Utc::now();
        let mut identities = BTreeSet::new();
        identities.insert(ExternalIdentity::new(auth.provider.as_str(), auth.uid.as_str()));

        Self {
            id: None,
            external_identities: identities,
            email: auth.email.clone(),
            name: placeholder_name(auth),
            is_external: false,
            is_admin: false,
            block_state: BlockState::Active,
            created_at: now,
            last_modified: now,
        }
    }

    /// Whether this account has ever been committed.
    pub fn persisted(&self) -> bool {
        self.id.is_some()
    }

    pub fn is_blocked(&self) -> bool {
        self.block_state == BlockState::Blocked
    }

    /// Transition to Blocked.
    pub fn block(&mut self) {
        self.block_state = BlockState::Blocked;
    }

    /// Transition to Active.
    pub fn activate(&mut self) {
        self.block_state = BlockState::Active;
    }

    pub fn has_identity(&self, provider: &str, uid: &str) -> bool {
        self.external_identities
            .contains(&ExternalIdentity::new(provider, uid))
    }

    /// Link an identity; returns true if it was newly added.
    pub fn link_identity(&mut self, provider: &str, uid: &str) -> bool {
        self.external_identities
            .insert(ExternalIdentity::new(provider, uid))
    }

    /// Snapshot of the fields whose change forces a commit.
    pub fn fingerprint(&self) -> AccountFingerprint {
        AccountFingerprint {
            block_state: self.block_state,
            is_external: self.is_external,
            is_admin: self.is_admin,
            external_identities: self.external_identities.clone(),
        }
    }
}

/// Comparison key for the dirty check: block state, policy flags, and
/// the identity set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountFingerprint {
    block_state: BlockState,
    is_external: bool,
    is_admin: bool,
    external_identities: BTreeSet<ExternalIdentity>,
}

/// Seed a display name from the email local part, falling back to the
/// uid for email-less assertions.
fn placeholder_name(auth: &AuthHash) -> String {
    match auth.email.split('@').next() {
        Some(local) if !local.is_empty() => local.to_string(),
        _ => auth.uid.clone(),
    }
}

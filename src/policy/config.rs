//! Group policy snapshot.
//!
//! Loaded once per resolution request and passed explicitly; the
//! resolver never reads ambient configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Group-membership policy applied during identity resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupPolicy {
    /// Groups of which membership in at least one is required to sign
    /// in. Empty means no gate.
    #[serde(default)]
    pub required_groups: BTreeSet<String>,

    /// Groups marking an account as external. `None` disables the
    /// feature entirely; an empty set marks nobody external but still
    /// clears the flag on every resolution.
    #[serde(default)]
    pub external_groups: Option<BTreeSet<String>>,

    /// Groups granting the admin flag. `None` disables the feature.
    #[serde(default)]
    pub admin_groups: Option<BTreeSet<String>>,

    /// Link assertions to existing accounts by email address.
    #[serde(default)]
    pub auto_link_by_email: bool,

    /// Consult the directory-link collaborator for unmatched
    /// assertions.
    #[serde(default)]
    pub auto_link_directory: bool,

    /// Build a new account for unmatched assertions.
    #[serde(default = "default_true")]
    pub signup_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for GroupPolicy {
    fn default() -> Self {
        Self {
            required_groups: BTreeSet::new(),
            external_groups: None,
            admin_groups: None,
            auto_link_by_email: false,
            auto_link_directory: false,
            signup_enabled: true,
        }
    }
}

impl GroupPolicy {
    /// Load a policy snapshot from a JSON document.
    pub fn load(json: &str) -> Result<Self> {
        let policy: Self =
            serde_json::from_str(json).context("Failed to parse group policy document")?;
        policy
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid group policy: {}", e))?;
        Ok(policy)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        let all_groups = self
            .required_groups
            .iter()
            .chain(self.external_groups.iter().flatten())
            .chain(self.admin_groups.iter().flatten());

        for group in all_groups {
            if group.trim().is_empty() {
                return Err("group names must be non-empty".to_string());
            }
        }

        Ok(())
    }

    /// The required-group gate: passes when no gate is configured or
    /// the asserted groups overlap the required set.
    pub fn required_groups_satisfied(&self, groups: &BTreeSet<String>) -> bool {
        self.required_groups.is_empty() || intersects(groups, &self.required_groups)
    }

    /// Whether the asserted groups mark the account external. Always
    /// false when the feature is off.
    pub fn marks_external(&self, groups: &BTreeSet<String>) -> bool {
        self.external_groups
            .as_ref()
            .is_some_and(|external| intersects(groups, external))
    }

    /// Whether the asserted groups grant the admin flag. Always false
    /// when the feature is off.
    pub fn marks_admin(&self, groups: &BTreeSet<String>) -> bool {
        self.admin_groups
            .as_ref()
            .is_some_and(|admin| intersects(groups, admin))
    }
}

fn intersects(a: &BTreeSet<String>, b: &BTreeSet<String>) -> bool {
    a.intersection(b).next().is_some()
}

/// Partial policy for dynamic reconfiguration; unset fields keep their
/// current values.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct GroupPolicyJson {
    pub required_groups: Option<BTreeSet<String>>,
    pub external_groups: Option<BTreeSet<String>>,
    pub admin_groups: Option<BTreeSet<String>>,
    pub auto_link_by_email: Option<bool>,
    pub auto_link_directory: Option<bool>,
    pub signup_enabled: Option<bool>,
}

impl GroupPolicyJson {
    /// Merge into an existing policy.
    pub fn apply_to(&self, policy: &mut GroupPolicy) {
        if let Some(ref required) = self.required_groups {
            policy.required_groups = required.clone();
        }
        if let Some(ref external) = self.external_groups {
            policy.external_groups = Some(external.clone());
        }
        if let Some(ref admin) = self.admin_groups {
            policy.admin_groups = Some(admin.clone());
        }
        if let Some(by_email) = self.auto_link_by_email {
            policy.auto_link_by_email = by_email;
        }
        if let Some(directory) = self.auto_link_directory {
            policy.auto_link_directory = directory;
        }
        if let Some(signup) = self.signup_enabled {
            policy.signup_enabled = signup;
        }
    }
}

//! The resolution state machine.
//!
//! Lookup order is strict and short-circuiting: exact identity match,
//! email match, directory link, new account, none. Whatever account
//! emerges is then gated on required-group membership before the
//! external/admin flags are recomputed.

use tracing::{debug, warn};

use crate::account::{Account, AccountStore};
use crate::assertion::AuthHash;
use crate::error::AuthError;
use crate::policy::GroupPolicy;

use super::audit::{record_transition, TransitionAction};

/// Outcome of one resolution attempt.
#[derive(Debug, Clone)]
pub struct Decision {
    /// The resolved account, or `None` when authentication must be
    /// refused. A returned account may still be blocked; the caller
    /// checks the block state.
    pub account: Option<Account>,

    /// Whether the account differs from its last-committed state and
    /// needs a commit.
    pub should_persist: bool,
}

impl Decision {
    fn rejected() -> Self {
        Self {
            account: None,
            should_persist: false,
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.account.is_none()
    }
}

/// Directory-service collaborator: finds or builds an account for
/// identities known to an external directory but not yet linked
/// locally, keyed by email or uid.
pub trait DirectoryLink {
    fn find_or_build(&self, auth: &AuthHash) -> Result<Option<Account>, AuthError>;
}

/// Resolves normalized assertions to local account decisions.
pub struct IdentityResolver<S> {
    store: S,
    directory: Option<Box<dyn DirectoryLink>>,
}

impl<S: AccountStore> IdentityResolver<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            directory: None,
        }
    }

    /// Install a directory-link collaborator, consulted only when the
    /// policy enables directory auto-linking.
    pub fn with_directory(mut self, directory: Box<dyn DirectoryLink>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resolve an assertion to an account decision. Pure apart from
    /// store reads; nothing is committed here.
    pub fn resolve(&self, auth: &AuthHash, policy: &GroupPolicy) -> Result<Decision, AuthError> {
        let mut account = match self.lookup(auth, policy)? {
            Some(account) => account,
            None => {
                debug!(provider = %auth.provider, uid = %auth.uid, "no account resolved");
                return Ok(Decision::rejected());
            }
        };

        if !policy.required_groups.is_empty() && auth.groups.is_empty() {
            // Misconfiguration or a stripped assertion; fail closed.
            warn!(
                provider = %auth.provider,
                uid = %auth.uid,
                "assertion carries no group claims, required-group check fails closed"
            );
        }

        if policy.required_groups_satisfied(&auth.groups) {
            if account.persisted() && account.is_blocked() {
                account.activate();
                record_transition(auth, &account, TransitionAction::Unblock, "in required group");
            }
        } else if account.persisted() {
            if !account.is_blocked() {
                account.block();
                record_transition(auth, &account, TransitionAction::Block, "not in required group");
            }
        } else {
            // A candidate that never had a chance to join the required
            // group: discard rather than create an account that cannot
            // sign in.
            debug!(
                provider = %auth.provider,
                uid = %auth.uid,
                "discarding unpersisted candidate outside required groups"
            );
            return Ok(Decision::rejected());
        }

        // Recomputed on every resolution so group membership changes
        // propagate on the next login; the flags are never sticky.
        account.is_external = policy.marks_external(&auth.groups);
        account.is_admin = policy.marks_admin(&auth.groups);

        account.link_identity(&auth.provider, &auth.uid);

        let should_persist = !account.persisted() || self.store.is_dirty(&account)?;

        Ok(Decision {
            account: Some(account),
            should_persist,
        })
    }

    /// Resolve and commit in one step. At most one commit is issued;
    /// clean decisions skip it. Returns the committed (or unchanged)
    /// account, or `None` when authentication must be refused.
    pub fn resolve_and_commit(
        &self,
        auth: &AuthHash,
        policy: &GroupPolicy,
    ) -> Result<Option<Account>, AuthError> {
        let decision = self.resolve(auth, policy)?;
        match decision.account {
            Some(account) if decision.should_persist => Ok(Some(self.store.commit(account)?)),
            other => Ok(other),
        }
    }

    /// Steps 1–4 of the lookup order; first match wins.
    fn lookup(&self, auth: &AuthHash, policy: &GroupPolicy) -> Result<Option<Account>, AuthError> {
        let mut account = self.store.find_by_identity(&auth.provider, &auth.uid)?;

        if account.is_none() && policy.auto_link_by_email && !auth.email.is_empty() {
            account = self.store.find_by_email(&auth.email)?;
        }

        if account.is_none() && policy.auto_link_directory {
            if let Some(directory) = &self.directory {
                account = directory.find_or_build(auth)?;
            }
        }

        if account.is_none() && policy.signup_enabled {
            account = Some(Account::build_from(auth));
        }

        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::RedbAccountStore;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn test_resolver() -> (IdentityResolver<RedbAccountStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = RedbAccountStore::open(dir.path().join("accounts.redb")).unwrap();
        (IdentityResolver::new(store), dir)
    }

    fn auth(uid: &str, email: &str, groups: &[&str]) -> AuthHash {
        AuthHash::new(
            uid,
            "saml",
            email,
            groups.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
    }

    fn groups(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn gated_policy(required: &[&str]) -> GroupPolicy {
        GroupPolicy {
            required_groups: groups(required),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_account_for_unmatched_assertion() {
        let (resolver, _dir) = test_resolver();
        let policy = gated_policy(&["required"]);

        let decision = resolver
            .resolve(&auth("u1", "jdoe@example.com", &["required"]), &policy)
            .unwrap();

        let account = decision.account.expect("account should be built");
        assert!(!account.persisted());
        assert!(account.has_identity("saml", "u1"));
        assert!(!account.is_external);
        assert!(decision.should_persist);
    }

    #[test]
    fn test_rejected_when_signup_disabled() {
        let (resolver, _dir) = test_resolver();
        let policy = GroupPolicy {
            signup_enabled: false,
            ..Default::default()
        };

        let decision = resolver
            .resolve(&auth("u1", "jdoe@example.com", &[]), &policy)
            .unwrap();
        assert!(decision.is_rejected());
        assert!(!decision.should_persist);
    }

    #[test]
    fn test_exact_match_wins_over_email_match() {
        let (resolver, _dir) = test_resolver();
        let by_identity = resolver
            .store()
            .commit(Account::build_from(&auth("u1", "first@example.com", &[])))
            .unwrap();
        resolver
            .store()
            .commit(Account::build_from(&auth("u2", "second@example.com", &[])))
            .unwrap();

        let policy = GroupPolicy {
            auto_link_by_email: true,
            ..Default::default()
        };
        // uid matches the first account, email the second.
        let decision = resolver
            .resolve(&auth("u1", "second@example.com", &[]), &policy)
            .unwrap();

        assert_eq!(decision.account.unwrap().id, by_identity.id);
    }

    #[test]
    fn test_email_match_links_identity() {
        let (resolver, _dir) = test_resolver();
        let existing = AuthHash::new("l1", "ldap", "jdoe@example.com", Vec::new());
        resolver
            .store()
            .commit(Account::build_from(&existing))
            .unwrap();

        let policy = GroupPolicy {
            auto_link_by_email: true,
            ..Default::default()
        };
        let decision = resolver
            .resolve(&auth("u1", "jdoe@example.com", &[]), &policy)
            .unwrap();

        let account = decision.account.unwrap();
        assert!(account.persisted());
        assert!(account.has_identity("ldap", "l1"));
        assert!(account.has_identity("saml", "u1"));
        assert!(decision.should_persist);
    }

    #[test]
    fn test_email_match_disabled_by_default() {
        let (resolver, _dir) = test_resolver();
        let existing = AuthHash::new("l1", "ldap", "jdoe@example.com", Vec::new());
        resolver
            .store()
            .commit(Account::build_from(&existing))
            .unwrap();

        let policy = GroupPolicy::default();
        let decision = resolver
            .resolve(&auth("u1", "jdoe@example.com", &[]), &policy)
            .unwrap();

        // Falls through to signup instead of linking by email.
        let account = decision.account.unwrap();
        assert!(!account.persisted());
    }

    #[test]
    fn test_blocked_account_unblocked_when_in_required_group() {
        let (resolver, _dir) = test_resolver();
        let mut account = Account::build_from(&auth("u1", "jdoe@example.com", &[]));
        account.block();
        resolver.store().commit(account).unwrap();

        let policy = gated_policy(&["required"]);
        let decision = resolver
            .resolve(&auth("u1", "jdoe@example.com", &["required", "other"]), &policy)
            .unwrap();

        let account = decision.account.unwrap();
        assert!(!account.is_blocked());
        assert!(decision.should_persist);
    }

    #[test]
    fn test_active_account_blocked_when_not_in_required_group() {
        let (resolver, _dir) = test_resolver();
        resolver
            .store()
            .commit(Account::build_from(&auth("u1", "jdoe@example.com", &[])))
            .unwrap();

        let policy = gated_policy(&["required"]);
        let decision = resolver
            .resolve(&auth("u1", "jdoe@example.com", &["other"]), &policy)
            .unwrap();

        let account = decision.account.unwrap();
        assert!(account.is_blocked());
        assert!(decision.should_persist);
    }

    #[test]
    fn test_blocked_account_stays_blocked_when_gate_fails() {
        let (resolver, _dir) = test_resolver();
        let mut account = Account::build_from(&auth("u1", "jdoe@example.com", &[]));
        account.block();
        resolver.store().commit(account).unwrap();

        let policy = gated_policy(&["required"]);
        let decision = resolver
            .resolve(&auth("u1", "jdoe@example.com", &[]), &policy)
            .unwrap();

        // Still returned, still blocked, nothing to persist.
        let account = decision.account.unwrap();
        assert!(account.is_blocked());
        assert!(!decision.should_persist);
    }

    #[test]
    fn test_unmatched_candidate_discarded_when_gate_fails() {
        let (resolver, _dir) = test_resolver();
        let policy = gated_policy(&["required"]);

        let decision = resolver
            .resolve(&auth("u1", "jdoe@example.com", &[]), &policy)
            .unwrap();

        assert!(decision.is_rejected());
        assert_eq!(resolver.store().count(), 0);
    }

    #[test]
    fn test_discarded_candidate_leaves_unlinked_account_untouched() {
        let (resolver, _dir) = test_resolver();
        // An account exists but shares neither identity nor (linkable)
        // email with the assertion.
        let existing = AuthHash::new("l1", "ldap", "jdoe@example.com", Vec::new());
        resolver
            .store()
            .commit(Account::build_from(&existing))
            .unwrap();

        // auto_link_by_email is off, so lookup builds a fresh candidate
        // which the gate then discards.
        let policy = gated_policy(&["required"]);
        let decision = resolver
            .resolve(&auth("u1", "jdoe@example.com", &[]), &policy)
            .unwrap();
        assert!(decision.is_rejected());

        let untouched = resolver
            .store()
            .find_by_identity("ldap", "l1")
            .unwrap()
            .unwrap();
        assert!(!untouched.is_blocked());
    }

    #[test]
    fn test_flags_recomputed_every_resolution() {
        let (resolver, _dir) = test_resolver();
        let policy = GroupPolicy {
            external_groups: Some(groups(&["eng"])),
            admin_groups: Some(groups(&["admins"])),
            ..Default::default()
        };

        let committed = resolver
            .resolve_and_commit(&auth("u1", "jdoe@example.com", &["eng", "admins"]), &policy)
            .unwrap()
            .unwrap();
        assert!(committed.is_external);
        assert!(committed.is_admin);

        // Membership dropped: both flags must flip back off.
        let decision = resolver
            .resolve(&auth("u1", "jdoe@example.com", &[]), &policy)
            .unwrap();
        let account = decision.account.unwrap();
        assert!(!account.is_external);
        assert!(!account.is_admin);
        assert!(decision.should_persist);
    }

    #[test]
    fn test_absent_group_config_never_sets_flags() {
        let (resolver, _dir) = test_resolver();
        let policy = GroupPolicy::default();

        let decision = resolver
            .resolve(&auth("u1", "jdoe@example.com", &["eng", "admins"]), &policy)
            .unwrap();

        let account = decision.account.unwrap();
        assert!(!account.is_external);
        assert!(!account.is_admin);
    }

    #[test]
    fn test_second_resolution_is_clean() {
        let (resolver, _dir) = test_resolver();
        let policy = GroupPolicy {
            external_groups: Some(groups(&["eng"])),
            ..Default::default()
        };
        let assertion = auth("u1", "jdoe@example.com", &["eng"]);

        resolver.resolve_and_commit(&assertion, &policy).unwrap().unwrap();

        let decision = resolver.resolve(&assertion, &policy).unwrap();
        assert!(!decision.should_persist);
        assert!(decision.account.unwrap().persisted());
    }

    #[test]
    fn test_no_group_claims_fails_closed_for_persisted_account() {
        let (resolver, _dir) = test_resolver();
        resolver
            .store()
            .commit(Account::build_from(&auth("u1", "jdoe@example.com", &[])))
            .unwrap();

        // Required groups configured but the assertion carries no group
        // claims at all: treated as not satisfied, never an error.
        let policy = gated_policy(&["required"]);
        let decision = resolver
            .resolve(&auth("u1", "jdoe@example.com", &[]), &policy)
            .unwrap();
        assert!(decision.account.unwrap().is_blocked());
    }

    struct StubDirectory;

    impl DirectoryLink for StubDirectory {
        fn find_or_build(&self, auth: &AuthHash) -> Result<Option<Account>, AuthError> {
            if auth.email == "directory@example.com" {
                let seed = AuthHash::new("d1", "ldap", auth.email.clone(), Vec::new());
                Ok(Some(Account::build_from(&seed)))
            } else {
                Ok(None)
            }
        }
    }

    #[test]
    fn test_directory_link_consulted_when_enabled() {
        let (resolver, _dir) = test_resolver();
        let resolver = IdentityResolver {
            directory: Some(Box::new(StubDirectory)),
            ..resolver
        };
        let policy = GroupPolicy {
            auto_link_directory: true,
            signup_enabled: false,
            ..Default::default()
        };

        let decision = resolver
            .resolve(&auth("u1", "directory@example.com", &[]), &policy)
            .unwrap();
        let account = decision.account.unwrap();
        assert!(account.has_identity("ldap", "d1"));
        assert!(account.has_identity("saml", "u1"));

        // Directory misses fall through to rejection with signup off.
        let decision = resolver
            .resolve(&auth("u2", "other@example.com", &[]), &policy)
            .unwrap();
        assert!(decision.is_rejected());
    }

    #[test]
    fn test_directory_link_skipped_when_disabled() {
        let (resolver, _dir) = test_resolver();
        let resolver = IdentityResolver {
            directory: Some(Box::new(StubDirectory)),
            ..resolver
        };
        let policy = GroupPolicy {
            auto_link_directory: false,
            signup_enabled: false,
            ..Default::default()
        };

        let decision = resolver
            .resolve(&auth("u1", "directory@example.com", &[]), &policy)
            .unwrap();
        assert!(decision.is_rejected());
    }

    #[test]
    fn test_resolve_and_commit_assigns_id_once() {
        let (resolver, _dir) = test_resolver();
        let policy = GroupPolicy::default();
        let assertion = auth("u1", "jdoe@example.com", &[]);

        let first = resolver.resolve_and_commit(&assertion, &policy).unwrap().unwrap();
        assert!(first.persisted());

        let second = resolver.resolve_and_commit(&assertion, &policy).unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(resolver.store().count(), 1);
    }

    #[test]
    fn test_resolve_and_commit_rejects_without_commit() {
        let (resolver, _dir) = test_resolver();
        let policy = GroupPolicy {
            signup_enabled: false,
            ..Default::default()
        };

        let result = resolver
            .resolve_and_commit(&auth("u1", "jdoe@example.com", &[]), &policy)
            .unwrap();
        assert!(result.is_none());
        assert_eq!(resolver.store().count(), 0);
    }

    #[test]
    fn test_commit_email_collision_surfaces() {
        let (resolver, _dir) = test_resolver();
        resolver
            .store()
            .commit(Account::build_from(&AuthHash::new(
                "other",
                "ldap",
                "jdoe@example.com",
                Vec::new(),
            )))
            .unwrap();

        // Email auto-link is off, so the new candidate collides with
        // the existing account's email at commit time.
        let policy = GroupPolicy::default();
        let err = resolver
            .resolve_and_commit(&auth("u1", "jdoe@example.com", &[]), &policy)
            .unwrap_err();
        assert!(matches!(err, AuthError::Persistence(_)));
    }
}

//! Structured audit events for block-state transitions.

use tracing::info;

use crate::account::Account;
use crate::assertion::AuthHash;

/// Direction of a block-state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionAction {
    Block,
    Unblock,
}

impl TransitionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Unblock => "unblock",
        }
    }
}

/// Emit the audit event for a block/unblock transition.
pub(crate) fn record_transition(
    auth: &AuthHash,
    account: &Account,
    action: TransitionAction,
    reason: &str,
) {
    info!(
        provider = %auth.provider,
        uid = %auth.uid,
        account_name = %account.name,
        account_email = %account.email,
        action = action.as_str(),
        reason,
        "account block state changed"
    );
}

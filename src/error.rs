//! Error taxonomy for assertion resolution and account persistence.

use thiserror::Error;

/// Errors surfaced to the authentication pipeline.
///
/// None of these are retried internally; a failed resolution must be
/// resubmitted by the identity provider.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The raw assertion was missing a mandatory field (uid or provider).
    #[error("malformed assertion: {0}")]
    MalformedAssertion(String),

    /// The account store rejected a lookup or commit.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The directory-link collaborator failed.
    #[error("directory lookup failed: {0}")]
    Directory(String),
}

/// Failures from the account store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Email uniqueness violated at commit time.
    #[error("email '{0}' already belongs to another account")]
    DuplicateEmail(String),

    /// Identity uniqueness violated at commit time.
    #[error("identity {provider}/{uid} already belongs to another account")]
    DuplicateIdentity { provider: String, uid: String },

    /// Referenced account id does not exist.
    #[error("account '{0}' not found")]
    NotFound(String),

    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Backend(String),
}

impl PersistenceError {
    /// Wrap an arbitrary storage-layer failure.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

//! Assertion value types.

use std::collections::{BTreeSet, HashMap};

/// A federated assertion after wire-level parsing, before normalization.
///
/// Produced by an external SAML/OIDC response parser; signature and
/// timestamp validation have already happened by the time this value
/// exists. Attributes are multi-valued because SAML allows it.
#[derive(Debug, Clone, Default)]
pub struct RawAssertion {
    /// Provider name the assertion arrived through (e.g. "saml").
    pub provider: Option<String>,

    /// Subject identifier (SAML NameID, OIDC sub is carried as an
    /// attribute instead).
    pub name_id: Option<String>,

    /// Entity ID of the issuing identity provider.
    pub issuer: Option<String>,

    /// Assertion attributes as name → values.
    pub attributes: HashMap<String, Vec<String>>,
}

impl RawAssertion {
    /// Get the first value of an attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|values| values.first())
            .map(|s| s.as_str())
    }

    /// Get all values of an attribute.
    pub fn attribute_values(&self, name: &str) -> &[String] {
        self.attributes.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// Normalized identity claim, built once per authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHash {
    /// Subject identifier at the identity provider.
    pub uid: String,

    /// Provider name.
    pub provider: String,

    /// Asserted email address. May be empty when the provider did not
    /// supply one; an empty email never participates in auto-linking.
    pub email: String,

    /// Issuer-declared group memberships.
    pub groups: BTreeSet<String>,
}

impl AuthHash {
    pub fn new(
        uid: impl Into<String>,
        provider: impl Into<String>,
        email: impl Into<String>,
        groups: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            uid: uid.into(),
            provider: provider.into(),
            email: email.into(),
            groups: groups.into_iter().collect(),
        }
    }
}

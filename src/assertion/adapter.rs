//! Assertion adapters.
//!
//! One adapter per federated source, selected when the authentication
//! pipeline is constructed.

use crate::error::AuthError;

use super::types::{AuthHash, RawAssertion};

/// Normalizes a provider-specific assertion into an [`AuthHash`].
pub trait AssertionAdapter {
    /// Build the auth hash, failing when uid or provider is absent.
    fn normalize(&self, raw: &RawAssertion) -> Result<AuthHash, AuthError>;
}

/// Adapter for SAML assertions.
///
/// The uid is the NameID; email and groups come from assertion
/// attributes whose names vary per IdP and are configurable here.
#[derive(Debug, Clone)]
pub struct SamlAssertionAdapter {
    /// Attribute carrying the email address.
    pub email_attribute: String,
    /// Attribute carrying group memberships.
    pub groups_attribute: String,
}

impl Default for SamlAssertionAdapter {
    fn default() -> Self {
        Self {
            email_attribute: "email".to_string(),
            groups_attribute: "groups".to_string(),
        }
    }
}

impl AssertionAdapter for SamlAssertionAdapter {
    fn normalize(&self, raw: &RawAssertion) -> Result<AuthHash, AuthError> {
        let provider = raw
            .provider
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| AuthError::MalformedAssertion("missing provider".to_string()))?;

        let uid = raw
            .name_id
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| AuthError::MalformedAssertion("missing NameID".to_string()))?;

        // Fall back to the NameID when it is an email address and no
        // email attribute was asserted.
        let email = raw
            .attribute(&self.email_attribute)
            .map(str::to_string)
            .or_else(|| uid.contains('@').then(|| uid.to_string()))
            .unwrap_or_default();

        let groups = raw
            .attribute_values(&self.groups_attribute)
            .iter()
            .cloned()
            .collect();

        Ok(AuthHash {
            uid: uid.to_string(),
            provider: provider.to_string(),
            email,
            groups,
        })
    }
}

/// Adapter for OIDC-style sources where the subject arrives as a claim
/// in the attribute map rather than as a NameID.
#[derive(Debug, Clone)]
pub struct OidcAssertionAdapter {
    pub subject_claim: String,
    pub email_claim: String,
    pub groups_claim: String,
}

impl Default for OidcAssertionAdapter {
    fn default() -> Self {
        Self {
            subject_claim: "sub".to_string(),
            email_claim: "email".to_string(),
            groups_claim: "groups".to_string(),
        }
    }
}

impl AssertionAdapter for OidcAssertionAdapter {
    fn normalize(&self, raw: &RawAssertion) -> Result<AuthHash, AuthError> {
        let provider = raw
            .provider
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| AuthError::MalformedAssertion("missing provider".to_string()))?;

        let uid = raw
            .attribute(&self.subject_claim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                AuthError::MalformedAssertion(format!("missing '{}' claim", self.subject_claim))
            })?;

        let email = raw
            .attribute(&self.email_claim)
            .map(str::to_string)
            .unwrap_or_default();

        let groups = raw
            .attribute_values(&self.groups_claim)
            .iter()
            .cloned()
            .collect();

        Ok(AuthHash {
            uid: uid.to_string(),
            provider: provider.to_string(),
            email,
            groups,
        })
    }
}

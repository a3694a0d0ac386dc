//! Assertion normalization.
//!
//! Adapters turn provider-specific assertion payloads into the stable
//! [`AuthHash`] value the resolver consumes.

mod adapter;
mod types;

pub use adapter::{AssertionAdapter, OidcAssertionAdapter, SamlAssertionAdapter};
pub use types::{AuthHash, RawAssertion};

//! Group-membership policy configuration.

mod config;

pub use config::{GroupPolicy, GroupPolicyJson};

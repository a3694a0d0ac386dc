//! Local account records and their persistence boundary.

mod store;
mod types;

pub use store::{AccountStore, RedbAccountStore};
pub use types::{Account, AccountFingerprint, BlockState, ExternalIdentity};

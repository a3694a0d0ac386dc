//! Account persistence backed by a redb embedded database.
//!
//! The store owns commit semantics: id assignment on first commit,
//! email and identity uniqueness, and the dirty check the resolver
//! uses to decide whether a resolution needs a commit at all.
//!
//! Layout:
//! - In-memory cache for fast lookups
//! - Secondary indexes for (provider, uid) identities and email
//! - Transactional consistency across all three tables

use anyhow::{Context, Result};
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::PersistenceError;

use super::types::{Account, ExternalIdentity};

/// Primary account table: UUID -> MessagePack<Account>.
const ACCOUNTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("accounts");
/// Secondary index: identity key -> UUID.
const IDENTITY_INDEX: TableDefinition<&str, &str> = TableDefinition::new("identity_index");
/// Secondary index: email -> UUID.
const EMAIL_INDEX: TableDefinition<&str, &str> = TableDefinition::new("email_index");

/// Loaded cache tuple: (accounts, identity_index, email_index).
type LoadedCaches = (
    HashMap<String, Account>,
    HashMap<String, String>,
    HashMap<String, String>,
);

/// Persistence boundary consumed by the resolver.
///
/// `commit` is invoked at most once per resolution and must serialize
/// concurrent commits for the same identity key and email.
pub trait AccountStore {
    /// Find the account owning the given federated identity.
    fn find_by_identity(
        &self,
        provider: &str,
        uid: &str,
    ) -> Result<Option<Account>, PersistenceError>;

    /// Find an account by email address.
    fn find_by_email(&self, email: &str) -> Result<Option<Account>, PersistenceError>;

    /// Commit an account, assigning an id on first commit. Fails on
    /// email or identity uniqueness violations.
    fn commit(&self, account: Account) -> Result<Account, PersistenceError>;

    /// Whether the account differs from its last-committed state on
    /// any commit-relevant field. Never-committed accounts are dirty.
    fn is_dirty(&self, account: &Account) -> Result<bool, PersistenceError>;
}

/// Account store with in-memory caches and persistent storage.
pub struct RedbAccountStore {
    db: Database,
    /// Primary cache: UUID -> Account.
    account_cache: RwLock<HashMap<String, Account>>,
    /// Index cache: identity key -> UUID.
    identity_cache: RwLock<HashMap<String, String>>,
    /// Index cache: email -> UUID.
    email_cache: RwLock<HashMap<String, String>>,
}

/// Compound index key. The 0x1F unit separator keeps provider/uid
/// pairs unambiguous in the flat index table.
fn identity_key(provider: &str, uid: &str) -> String {
    format!("{}\u{1f}{}", provider, uid)
}

impl RedbAccountStore {
    /// Open or create an account store at the given path.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open account database: {:?}", path))?;

        // Initialize tables
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ACCOUNTS_TABLE)?;
            let _ = write_txn.open_table(IDENTITY_INDEX)?;
            let _ = write_txn.open_table(EMAIL_INDEX)?;
        }
        write_txn.commit()?;

        let (account_cache, identity_cache, email_cache) = Self::load_all(&db)?;
        debug!(accounts = account_cache.len(), "Loaded accounts into cache");

        Ok(Self {
            db,
            account_cache: RwLock::new(account_cache),
            identity_cache: RwLock::new(identity_cache),
            email_cache: RwLock::new(email_cache),
        })
    }

    /// Get an account by UUID.
    pub fn get(&self, id: &str) -> Result<Option<Account>, PersistenceError> {
        if let Ok(cache) = self.account_cache.read() {
            if let Some(account) = cache.get(id) {
                return Ok(Some(account.clone()));
            }
        }

        // Fall back to database
        let read_txn = self.db.begin_read().map_err(PersistenceError::backend)?;
        let table = read_txn
            .open_table(ACCOUNTS_TABLE)
            .map_err(PersistenceError::backend)?;
        match table.get(id).map_err(PersistenceError::backend)? {
            Some(value) => {
                let account: Account =
                    rmp_serde::from_slice(value.value()).map_err(PersistenceError::backend)?;

                if let Ok(mut cache) = self.account_cache.write() {
                    cache.insert(id.to_string(), account.clone());
                }

                Ok(Some(account))
            }
            None => Ok(None),
        }
    }

    /// Total account count.
    pub fn count(&self) -> usize {
        self.account_cache.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Reject commits that would steal an email or identity owned by a
    /// different account. Caches are authoritative: they are loaded
    /// wholesale at open and maintained on every commit.
    fn check_uniqueness(&self, account: &Account) -> Result<(), PersistenceError> {
        let own_id = account.id.as_deref();

        if !account.email.is_empty() {
            if let Ok(cache) = self.email_cache.read() {
                if let Some(owner) = cache.get(&account.email) {
                    if Some(owner.as_str()) != own_id {
                        return Err(PersistenceError::DuplicateEmail(account.email.clone()));
                    }
                }
            }
        }

        if let Ok(cache) = self.identity_cache.read() {
            for identity in &account.external_identities {
                let key = identity_key(&identity.provider, &identity.uid);
                if let Some(owner) = cache.get(&key) {
                    if Some(owner.as_str()) != own_id {
                        return Err(PersistenceError::DuplicateIdentity {
                            provider: identity.provider.clone(),
                            uid: identity.uid.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Write an account row plus index maintenance in one transaction.
    /// `old` carries the previously committed state for stale-index
    /// cleanup on updates.
    fn write_account(
        &self,
        id: &str,
        account: &Account,
        old: Option<&Account>,
    ) -> Result<(), PersistenceError> {
        let data = rmp_serde::to_vec_named(account).map_err(PersistenceError::backend)?;

        let write_txn = self.db.begin_write().map_err(PersistenceError::backend)?;
        {
            let mut accounts_table = write_txn
                .open_table(ACCOUNTS_TABLE)
                .map_err(PersistenceError::backend)?;
            let mut identity_index = write_txn
                .open_table(IDENTITY_INDEX)
                .map_err(PersistenceError::backend)?;
            let mut email_index = write_txn
                .open_table(EMAIL_INDEX)
                .map_err(PersistenceError::backend)?;

            // Remove stale indexes
            if let Some(old) = old {
                if !old.email.is_empty() && old.email != account.email {
                    email_index
                        .remove(old.email.as_str())
                        .map_err(PersistenceError::backend)?;
                }
                for identity in old.external_identities.difference(&account.external_identities) {
                    identity_index
                        .remove(identity_key(&identity.provider, &identity.uid).as_str())
                        .map_err(PersistenceError::backend)?;
                }
            }

            accounts_table
                .insert(id, data.as_slice())
                .map_err(PersistenceError::backend)?;
            if !account.email.is_empty() {
                email_index
                    .insert(account.email.as_str(), id)
                    .map_err(PersistenceError::backend)?;
            }
            for identity in &account.external_identities {
                identity_index
                    .insert(identity_key(&identity.provider, &identity.uid).as_str(), id)
                    .map_err(PersistenceError::backend)?;
            }
        }
        write_txn.commit().map_err(PersistenceError::backend)?;

        // Update caches
        if let Ok(mut cache) = self.email_cache.write() {
            if let Some(old) = old {
                if !old.email.is_empty() && old.email != account.email {
                    cache.remove(&old.email);
                }
            }
            if !account.email.is_empty() {
                cache.insert(account.email.clone(), id.to_string());
            }
        }
        if let Ok(mut cache) = self.identity_cache.write() {
            if let Some(old) = old {
                for identity in old.external_identities.difference(&account.external_identities) {
                    cache.remove(&identity_key(&identity.provider, &identity.uid));
                }
            }
            for identity in &account.external_identities {
                cache.insert(identity_key(&identity.provider, &identity.uid), id.to_string());
            }
        }
        if let Ok(mut cache) = self.account_cache.write() {
            cache.insert(id.to_string(), account.clone());
        }

        Ok(())
    }

    /// Load all accounts and build index caches from the database.
    fn load_all(db: &Database) -> Result<LoadedCaches> {
        let mut accounts = HashMap::new();
        let mut identities = HashMap::new();
        let mut emails = HashMap::new();

        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS_TABLE)?;

        for entry in table.iter()? {
            let (key, value) = entry?;
            match rmp_serde::from_slice::<Account>(value.value()) {
                Ok(account) => {
                    let id = key.value().to_string();
                    for identity in &account.external_identities {
                        identities
                            .insert(identity_key(&identity.provider, &identity.uid), id.clone());
                    }
                    if !account.email.is_empty() {
                        emails.insert(account.email.clone(), id.clone());
                    }
                    accounts.insert(id, account);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to deserialize account during load, skipping");
                }
            }
        }

        Ok((accounts, identities, emails))
    }

    fn find_by_index_key(
        &self,
        cache: &RwLock<HashMap<String, String>>,
        table: TableDefinition<'static, &'static str, &'static str>,
        key: &str,
    ) -> Result<Option<Account>, PersistenceError> {
        let id = if let Ok(cache) = cache.read() {
            cache.get(key).cloned()
        } else {
            None
        };

        if let Some(id) = id {
            return self.get(&id);
        }

        // Fall back to database index
        let id = {
            let read_txn = self.db.begin_read().map_err(PersistenceError::backend)?;
            let table = read_txn.open_table(table).map_err(PersistenceError::backend)?;
            table
                .get(key)
                .map_err(PersistenceError::backend)?
                .map(|value| value.value().to_string())
        };

        match id {
            Some(id) => self.get(&id),
            None => Ok(None),
        }
    }
}

impl AccountStore for RedbAccountStore {
    fn find_by_identity(
        &self,
        provider: &str,
        uid: &str,
    ) -> Result<Option<Account>, PersistenceError> {
        self.find_by_index_key(&self.identity_cache, IDENTITY_INDEX, &identity_key(provider, uid))
    }

    fn find_by_email(&self, email: &str) -> Result<Option<Account>, PersistenceError> {
        if email.is_empty() {
            return Ok(None);
        }
        self.find_by_index_key(&self.email_cache, EMAIL_INDEX, email)
    }

    fn commit(&self, mut account: Account) -> Result<Account, PersistenceError> {
        match account.id.clone() {
            None => {
                self.check_uniqueness(&account)?;

                let id = Uuid::new_v4().to_string();
                account.id = Some(id.clone());
                account.last_modified = Utc::now();

                self.write_account(&id, &account, None)?;
                debug!(account_id = %id, email = %account.email, "Committed new account");
                Ok(account)
            }
            Some(id) => {
                let old = self
                    .get(&id)?
                    .ok_or_else(|| PersistenceError::NotFound(id.clone()))?;

                self.check_uniqueness(&account)?;
                account.last_modified = Utc::now();

                self.write_account(&id, &account, Some(&old))?;
                debug!(account_id = %id, "Committed account update");
                Ok(account)
            }
        }
    }

    fn is_dirty(&self, account: &Account) -> Result<bool, PersistenceError> {
        let Some(id) = account.id.as_deref() else {
            return Ok(true);
        };
        match self.get(id)? {
            Some(committed) => Ok(committed.fingerprint() != account.fingerprint()),
            None => Ok(true),
        }
    }
}

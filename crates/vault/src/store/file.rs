// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSON-file account store with atomic writes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::account::{epoch_ms, Account, AccountFilter};
use crate::error::VaultError;
use crate::store::AccountStore;

/// On-disk layout. Token fields are already ciphertext.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PersistedAccounts {
    #[serde(default)]
    pub accounts: HashMap<String, Account>,
}

/// Account store backed by a single JSON file.
///
/// The whole file is rewritten on every mutation, so this suits small pools
/// and single-process deployments.
#[derive(Debug)]
pub struct FileAccountStore {
    path: PathBuf,
    accounts: Mutex<HashMap<String, Account>>,
}

impl FileAccountStore {
    /// Open the store, loading existing accounts if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let accounts = if path.exists() { load(&path)?.accounts } else { HashMap::new() };
        tracing::debug!(path = %path.display(), count = accounts.len(), "loaded account store");
        Ok(Self { path, accounts: Mutex::new(accounts) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn commit(&self, accounts: &mut HashMap<String, Account>, account: Account) -> Result<(), VaultError> {
        let mut next = accounts.clone();
        next.insert(account.id.clone(), account);
        let snapshot = PersistedAccounts { accounts: next };
        save(&self.path, &snapshot).map_err(|e| VaultError::Store(format!("{e:#}")))?;
        *accounts = snapshot.accounts;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for FileAccountStore {
    async fn get(&self, id: &str) -> Result<Option<Account>, VaultError> {
        Ok(self.accounts.lock().get(id).cloned())
    }

    async fn create(&self, mut account: Account) -> Result<Account, VaultError> {
        let mut accounts = self.accounts.lock();
        if accounts.contains_key(&account.id) {
            return Err(VaultError::Store(format!("account {} already exists", account.id)));
        }
        account.version = 1;
        self.commit(&mut accounts, account.clone())?;
        Ok(account)
    }

    async fn update(&self, mut account: Account) -> Result<Account, VaultError> {
        let mut accounts = self.accounts.lock();
        let Some(current) = accounts.get(&account.id) else {
            return Err(VaultError::AccountNotFound(account.id));
        };
        if current.version != account.version {
            return Err(VaultError::VersionConflict(account.id));
        }
        account.version += 1;
        account.updated_at_ms = epoch_ms();
        self.commit(&mut accounts, account.clone())?;
        Ok(account)
    }

    async fn list(&self, filter: &AccountFilter) -> Result<(Vec<Account>, usize), VaultError> {
        let accounts = self.accounts.lock();
        Ok(super::page(accounts.values(), filter))
    }
}

/// Load persisted accounts from a JSON file.
pub fn load(path: &Path) -> anyhow::Result<PersistedAccounts> {
    let contents = std::fs::read_to_string(path)?;
    let accounts: PersistedAccounts = serde_json::from_str(&contents)?;
    Ok(accounts)
}

/// Write atomically: unique tmp file (PID + counter) then rename, so
/// concurrent saves never interleave bytes in a shared tmp file.
pub fn save(path: &Path, accounts: &PersistedAccounts) -> anyhow::Result<()> {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(accounts)?;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        "{}.{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
        seq,
    );
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::account::{epoch_ms, Account, AccountFilter};
use crate::error::VaultError;
use crate::store::AccountStore;

/// In-process account store.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    accounts: RwLock<HashMap<String, Account>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.accounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.read().is_empty()
    }

    /// Copy of every stored account.
    pub fn snapshot(&self) -> Vec<Account> {
        self.accounts.read().values().cloned().collect()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn get(&self, id: &str) -> Result<Option<Account>, VaultError> {
        Ok(self.accounts.read().get(id).cloned())
    }

    async fn create(&self, mut account: Account) -> Result<Account, VaultError> {
        let mut accounts = self.accounts.write();
        if accounts.contains_key(&account.id) {
            return Err(VaultError::Store(format!("account {} already exists", account.id)));
        }
        account.version = 1;
        accounts.insert(account.id.clone(), account.clone());
        Ok(account)
    }

    async fn update(&self, mut account: Account) -> Result<Account, VaultError> {
        let mut accounts = self.accounts.write();
        let Some(current) = accounts.get_mut(&account.id) else {
            return Err(VaultError::AccountNotFound(account.id));
        };
        if current.version != account.version {
            return Err(VaultError::VersionConflict(account.id));
        }
        account.version += 1;
        account.updated_at_ms = epoch_ms();
        *current = account.clone();
        Ok(account)
    }

    async fn list(&self, filter: &AccountFilter) -> Result<(Vec<Account>, usize), VaultError> {
        let accounts = self.accounts.read();
        Ok(super::page(accounts.values(), filter))
    }
}

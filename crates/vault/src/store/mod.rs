// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Account persistence contract and bundled implementations.

pub mod file;
pub mod memory;

use async_trait::async_trait;

use crate::account::{Account, AccountFilter};
use crate::error::VaultError;

pub use file::FileAccountStore;
pub use memory::MemoryAccountStore;

/// Attempts a read-modify-write makes before giving up on version conflicts.
const MAX_CONFLICT_RETRIES: usize = 5;

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Account>, VaultError>;

    async fn create(&self, account: Account) -> Result<Account, VaultError>;

    /// Persist `account` if its `version` still matches the stored one.
    ///
    /// Returns the stored copy with the bumped version, or
    /// [`VaultError::VersionConflict`] if someone else wrote first.
    async fn update(&self, account: Account) -> Result<Account, VaultError>;

    /// One page of matching accounts plus the total match count.
    async fn list(&self, filter: &AccountFilter) -> Result<(Vec<Account>, usize), VaultError>;
}

/// Read-modify-write an account, retrying on version conflicts.
///
/// `apply` may run more than once; it must only depend on the account it is
/// handed.
pub async fn modify<F, T>(store: &dyn AccountStore, id: &str, mut apply: F) -> Result<(Account, T), VaultError>
where
    F: FnMut(&mut Account) -> T + Send,
    T: Send,
{
    let mut last = VaultError::VersionConflict(id.to_owned());
    for attempt in 0..MAX_CONFLICT_RETRIES {
        let mut account = store.get(id).await?.ok_or_else(|| VaultError::AccountNotFound(id.to_owned()))?;
        let out = apply(&mut account);
        match store.update(account).await {
            Ok(saved) => return Ok((saved, out)),
            Err(e @ VaultError::VersionConflict(_)) => {
                tracing::debug!(account = %id, attempt, "version conflict, retrying");
                last = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last)
}

/// Shared paging/sorting used by the bundled stores.
///
/// Accounts are ordered by soonest expiry, then id, so refresh batches see the
/// most urgent accounts first and pagination is stable.
fn page<'a>(accounts: impl Iterator<Item = &'a Account>, filter: &AccountFilter) -> (Vec<Account>, usize) {
    let mut matched: Vec<&Account> = accounts.filter(|a| filter.matches(a)).collect();
    matched.sort_by(|a, b| {
        a.token_expires_at_ms
            .unwrap_or(u64::MAX)
            .cmp(&b.token_expires_at_ms.unwrap_or(u64::MAX))
            .then_with(|| a.id.cmp(&b.id))
    });
    let total = matched.len();
    let size = filter.page_size.max(1);
    let skip = filter.page.saturating_sub(1).saturating_mul(size);
    let items = matched.into_iter().skip(skip).take(size).cloned().collect();
    (items, total)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

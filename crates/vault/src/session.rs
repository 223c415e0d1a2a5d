// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Short-lived PKCE authorization sessions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::account::{ProviderType, ProxyConfig};
use crate::error::VaultError;

/// Default lifetime of an authorization session.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(600);

/// Pending authorization awaiting its code.
#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthSession {
    pub provider: ProviderType,
    pub code_verifier: String,
    pub code_challenge: String,
    pub state: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

impl fmt::Debug for OAuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthSession")
            .field("provider", &self.provider)
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("proxy", &self.proxy)
            .field("expires_at_ms", &self.expires_at_ms)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn set(&self, key: &str, session: OAuthSession, ttl: Duration) -> Result<(), VaultError>;

    async fn get(&self, key: &str) -> Result<Option<OAuthSession>, VaultError>;

    async fn delete(&self, key: &str) -> Result<(), VaultError>;

    /// Fetch and remove in one step.
    ///
    /// The default reads then deletes, which is only at-most-once when no
    /// other caller races on the same key. Stores that can do better should
    /// override it.
    async fn take(&self, key: &str) -> Result<Option<OAuthSession>, VaultError> {
        let session = self.get(key).await?;
        if session.is_some() {
            self.delete(key).await?;
        }
        Ok(session)
    }
}

struct Entry {
    session: OAuthSession,
    deadline: Instant,
}

/// In-process session store with lazy TTL eviction and atomic `take`.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop expired sessions. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.deadline > now);
        before - entries.len()
    }

    /// Periodically purge expired sessions until `shutdown` fires.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let purged = store.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "purged expired authorization sessions");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn set(&self, key: &str, session: OAuthSession, ttl: Duration) -> Result<(), VaultError> {
        let deadline = Instant::now() + ttl;
        self.entries.lock().insert(key.to_owned(), Entry { session, deadline });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<OAuthSession>, VaultError> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(e) if e.deadline > Instant::now() => Ok(Some(e.session.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), VaultError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<OAuthSession>, VaultError> {
        let entry = self.entries.lock().remove(key);
        Ok(entry.filter(|e| e.deadline > Instant::now()).map(|e| e.session))
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;

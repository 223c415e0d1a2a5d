// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Coopvault: credential lifecycle for pooled upstream AI accounts.
//!
//! Runs PKCE authorization sessions, exchanges codes for encrypted tokens,
//! keeps access tokens fresh, and tracks per-account health behind a circuit
//! breaker so a router can skip accounts that are failing.

pub mod account;
pub mod authorize;
pub mod circuit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod exchange;
pub mod health;
pub mod oauth;
pub mod pkce;
pub mod provider;
pub mod refresh;
pub mod session;
pub mod store;
pub mod test_support;

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub use crate::account::{Account, AccountStatus, ProviderType, ProxyConfig};
pub use crate::authorize::{AuthorizationUrl, Authorizer, BeginAuthorization};
pub use crate::config::VaultConfig;
pub use crate::error::VaultError;
pub use crate::events::CredentialEvent;
pub use crate::exchange::{CompleteAuthorization, Provisioned};
pub use crate::health::HealthMonitor;
pub use crate::refresh::{RefreshEngine, RefreshSummary};

use crate::crypto::TokenCipher;
use crate::provider::ProviderRegistry;
use crate::session::SessionStore;
use crate::store::AccountStore;

/// Wired set of credential-lifecycle components sharing one store, cipher,
/// provider registry, and event channel.
pub struct Vault {
    pub authorizer: Authorizer,
    pub health: Arc<HealthMonitor>,
    pub refresh: Arc<RefreshEngine>,
    pub event_tx: broadcast::Sender<CredentialEvent>,
}

impl Vault {
    pub fn new(
        config: &VaultConfig,
        accounts: Arc<dyn AccountStore>,
        sessions: Arc<dyn SessionStore>,
        cipher: Arc<TokenCipher>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&accounts),
            Arc::clone(&registry),
            Arc::clone(&cipher),
            config.circuit_policy(),
            event_tx.clone(),
        ));
        let authorizer = Authorizer::new(
            Arc::clone(&accounts),
            sessions,
            Arc::clone(&cipher),
            Arc::clone(&registry),
            Arc::clone(&health),
            config.session_ttl(),
            event_tx.clone(),
        );
        let refresh = Arc::new(RefreshEngine::new(
            accounts,
            registry,
            cipher,
            Arc::clone(&health),
            config.retry_policy(),
            config.batch_policy(),
            event_tx.clone(),
        ));
        Self { authorizer, health, refresh, event_tx }
    }

    /// Spawn the refresh cadences and the probe loop. They stop when
    /// `shutdown` is cancelled.
    pub fn spawn_background(
        &self,
        config: &VaultConfig,
        shutdown: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        self.refresh.spawn_schedules(config.schedule(), shutdown)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CredentialEvent> {
        self.event_tx.subscribe()
    }
}

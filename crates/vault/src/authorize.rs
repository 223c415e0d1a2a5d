// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Starting an OAuth authorization: PKCE material, a persisted session, and
//! the provider URL the user visits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::account::{epoch_ms, ProviderType, ProxyConfig};
use crate::crypto::TokenCipher;
use crate::error::VaultError;
use crate::events::CredentialEvent;
use crate::health::HealthMonitor;
use crate::pkce::PkcePair;
use crate::provider::{AuthUrlParams, ProviderRegistry};
use crate::session::{OAuthSession, SessionStore};
use crate::store::AccountStore;

/// Request to start an authorization flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginAuthorization {
    pub provider: ProviderType,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// Falls back to the provider's registered redirect URI.
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// Falls back to the provider's default scopes.
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl BeginAuthorization {
    pub fn new(provider: ProviderType) -> Self {
        Self { provider, proxy: None, redirect_uri: None, scopes: None, metadata: HashMap::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationUrl {
    pub auth_url: String,
    pub session_id: String,
    pub state: String,
}

/// Runs the two halves of the authorization-code flow.
///
/// [`Authorizer::begin_authorization`] lives here; completion is in
/// [`crate::exchange`].
pub struct Authorizer {
    pub(crate) accounts: Arc<dyn AccountStore>,
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) cipher: Arc<TokenCipher>,
    pub(crate) registry: Arc<ProviderRegistry>,
    pub(crate) health: Arc<HealthMonitor>,
    pub(crate) session_ttl: Duration,
    pub(crate) event_tx: broadcast::Sender<CredentialEvent>,
}

impl Authorizer {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        sessions: Arc<dyn SessionStore>,
        cipher: Arc<TokenCipher>,
        registry: Arc<ProviderRegistry>,
        health: Arc<HealthMonitor>,
        session_ttl: Duration,
        event_tx: broadcast::Sender<CredentialEvent>,
    ) -> Self {
        Self { accounts, sessions, cipher, registry, health, session_ttl, event_tx }
    }

    /// Generate PKCE material, persist a session, and build the provider URL.
    ///
    /// No URL is returned unless the session was stored.
    pub async fn begin_authorization(&self, request: BeginAuthorization) -> Result<AuthorizationUrl, VaultError> {
        let provider = self.registry.get(request.provider)?;
        let pkce = PkcePair::generate();
        let redirect_uri = request.redirect_uri.unwrap_or_else(|| provider.default_redirect_uri().to_owned());
        let scopes = request.scopes.unwrap_or_else(|| provider.default_scopes().to_vec());

        let auth_url = provider.build_auth_url(&AuthUrlParams {
            code_challenge: &pkce.challenge,
            state: &pkce.state,
            redirect_uri: &redirect_uri,
            scopes: &scopes,
        });

        let session_id = uuid::Uuid::new_v4().to_string();
        let now = epoch_ms();
        let session = OAuthSession {
            provider: request.provider,
            code_verifier: pkce.verifier,
            code_challenge: pkce.challenge,
            state: pkce.state.clone(),
            redirect_uri,
            scopes,
            proxy: request.proxy,
            metadata: request.metadata,
            created_at_ms: now,
            expires_at_ms: now.saturating_add(self.session_ttl.as_millis() as u64),
        };
        self.sessions.set(&session_id, session, self.session_ttl).await.map_err(|e| match e {
            e @ VaultError::SessionPersist(_) => e,
            other => VaultError::SessionPersist(other.to_string()),
        })?;

        tracing::info!(session = %session_id, provider = %request.provider, "authorization started");
        Ok(AuthorizationUrl { auth_url, session_id, state: pkce.state })
    }
}

#[cfg(test)]
#[path = "authorize_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Completing an authorization: code exchange and account provisioning.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::account::{epoch_ms, Account, AccountStatus, RateLimits, SealedToken, MAX_HEALTH};
use crate::authorize::Authorizer;
use crate::circuit::CircuitState;
use crate::error::VaultError;
use crate::events::CredentialEvent;
use crate::oauth::{normalize_code, OAuthTokenSet};
use crate::provider::CodeExchange;
use crate::session::OAuthSession;

/// Request to finish an authorization flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteAuthorization {
    pub session_id: String,
    /// Raw user input: a callback URL, `code#state`, or a bare code.
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rpm_limit: Option<u32>,
    #[serde(default)]
    pub tpm_limit: Option<u32>,
    /// Merged over the session's metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provisioned {
    pub account_id: String,
    pub status: AccountStatus,
    pub token_expires_at_ms: u64,
}

impl Authorizer {
    /// Exchange the pasted code and provision an account.
    ///
    /// The session is single-use: it is consumed before the exchange, whatever
    /// the outcome. Validation afterwards only affects status and health.
    pub async fn complete_authorization(&self, request: CompleteAuthorization) -> Result<Provisioned, VaultError> {
        let session = self.sessions.take(&request.session_id).await?.ok_or(VaultError::SessionNotFound)?;
        let result = self.provision(&session, request.clone()).await;
        if let Err(e) = self.sessions.delete(&request.session_id).await {
            tracing::warn!(session = %request.session_id, err = %e, "failed to delete authorization session");
        }
        match &result {
            Ok(provisioned) => tracing::info!(
                session = %request.session_id,
                account = %provisioned.account_id,
                provider = %session.provider,
                status = provisioned.status.as_str(),
                "account provisioned"
            ),
            Err(e) => tracing::warn!(session = %request.session_id, err = %e, "authorization failed"),
        }
        result
    }

    async fn provision(&self, session: &OAuthSession, request: CompleteAuthorization) -> Result<Provisioned, VaultError> {
        if epoch_ms() > session.expires_at_ms {
            return Err(VaultError::SessionExpired);
        }
        let normalized = normalize_code(&request.code)?;
        if normalized.state.as_deref().is_some_and(|s| s != session.state) {
            return Err(VaultError::StateMismatch);
        }

        let provider = self.registry.get(session.provider)?;
        let exchange = CodeExchange {
            code: &normalized.code,
            code_verifier: &session.code_verifier,
            redirect_uri: &session.redirect_uri,
            state: &session.state,
        };
        let tokens = provider
            .exchange_code(&exchange, session.proxy.as_ref())
            .await
            .map_err(|e| VaultError::TokenExchangeFailed { status: e.status(), message: e.to_string() })?;

        let account = self.build_account(session, request, tokens)?;
        let account = self.accounts.create(account).await?;
        let account_id = account.id.clone();

        match self.health.validate(&account_id).await {
            Ok(outcome) => tracing::debug!(account = %account_id, ?outcome, "post-provision validation"),
            Err(e) => tracing::warn!(account = %account_id, err = %e, "post-provision validation errored"),
        }
        let account = self.accounts.get(&account_id).await?.unwrap_or(account);

        let _ = self.event_tx.send(CredentialEvent::Provisioned {
            account_id: account_id.clone(),
            name: account.name.clone(),
            provider: account.provider,
            status: account.status,
        });
        Ok(Provisioned {
            account_id,
            status: account.status,
            token_expires_at_ms: account.token_expires_at_ms.unwrap_or_default(),
        })
    }

    fn build_account(
        &self,
        session: &OAuthSession,
        request: CompleteAuthorization,
        tokens: OAuthTokenSet,
    ) -> Result<Account, VaultError> {
        if tokens.access_token.is_empty() {
            return Err(VaultError::IncompleteTokenResponse("missing access_token".to_owned()));
        }
        let refresh_token = tokens
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| VaultError::IncompleteTokenResponse("missing refresh_token".to_owned()))?;

        let seal = |plain: &str| {
            self.cipher.encrypt_str(plain).map(SealedToken::from_ciphertext).map_err(VaultError::EncryptionFailure)
        };
        let access_token = seal(&tokens.access_token)?;
        let refresh_token = seal(refresh_token)?;
        let id_token = tokens.id_token.as_deref().filter(|t| !t.is_empty()).map(seal).transpose()?;

        let now = epoch_ms();
        let mut metadata = session.metadata.clone();
        metadata.extend(request.metadata);
        Ok(Account {
            id: uuid::Uuid::new_v4().to_string(),
            name: request.name,
            description: request.description,
            provider: session.provider,
            status: AccountStatus::Created,
            health_score: MAX_HEALTH,
            access_token,
            refresh_token,
            id_token,
            token_expires_at_ms: Some(now.saturating_add(tokens.expires_in_secs_or_default().saturating_mul(1000))),
            organizations: tokens.organizations,
            proxy: session.proxy.clone(),
            rate_limits: RateLimits { rpm: request.rpm_limit, tpm: request.tpm_limit },
            circuit: CircuitState::default(),
            metadata,
            created_at_ms: now,
            updated_at_ms: now,
            last_refresh_attempt_at_ms: None,
            last_error: None,
            version: 0,
        })
    }
}

#[cfg(test)]
#[path = "exchange_tests.rs"]
mod tests;

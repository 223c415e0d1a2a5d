// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Health scoring and circuit breaking for pooled accounts.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::account::{epoch_ms, Account, AccountFilter, AccountStatus};
use crate::circuit::{self, Admission, CircuitPhase, CircuitPolicy, Transition};
use crate::crypto::TokenCipher;
use crate::error::VaultError;
use crate::events::CredentialEvent;
use crate::provider::{ProviderError, ProviderRegistry};
use crate::store::{self, AccountStore};

/// Result of a validation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Passed,
    Failed { terminal: bool, message: String },
    /// API-key account or no provider registered; health untouched.
    Skipped,
}

/// Applies success/failure outcomes to accounts and announces circuit
/// transitions.
pub struct HealthMonitor {
    store: Arc<dyn AccountStore>,
    registry: Arc<ProviderRegistry>,
    cipher: Arc<TokenCipher>,
    policy: CircuitPolicy,
    event_tx: broadcast::Sender<CredentialEvent>,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn AccountStore>,
        registry: Arc<ProviderRegistry>,
        cipher: Arc<TokenCipher>,
        policy: CircuitPolicy,
        event_tx: broadcast::Sender<CredentialEvent>,
    ) -> Self {
        Self { store, registry, cipher, policy, event_tx }
    }

    pub fn policy(&self) -> &CircuitPolicy {
        &self.policy
    }

    pub async fn report_success(&self, account_id: &str) -> Result<Account, VaultError> {
        let now = epoch_ms();
        let policy = &self.policy;
        let (account, transition) = store::modify(&*self.store, account_id, |a| {
            a.last_error = None;
            circuit::record_success(a, policy, now)
        })
        .await?;
        self.announce(&account, transition, now);
        Ok(account)
    }

    /// `terminal` marks failures that prove the credential is dead; they
    /// break the circuit without waiting for the failure threshold.
    pub async fn report_failure(&self, account_id: &str, terminal: bool, error: &str) -> Result<Account, VaultError> {
        let now = epoch_ms();
        let policy = &self.policy;
        let (account, transition) = store::modify(&*self.store, account_id, |a| {
            a.last_error = Some(error.to_owned());
            circuit::record_failure(a, policy, terminal, now)
        })
        .await?;
        tracing::debug!(
            account = %account_id,
            terminal,
            health = account.health_score,
            failures = account.circuit.consecutive_failures,
            "recorded failure"
        );
        self.announce(&account, transition, now);
        Ok(account)
    }

    /// Gate an upstream call for `account_id`, promoting it to half-open if
    /// its backoff has elapsed.
    pub async fn admit(&self, account_id: &str) -> Result<Account, VaultError> {
        let account =
            self.store.get(account_id).await?.ok_or_else(|| VaultError::AccountNotFound(account_id.to_owned()))?;
        let now = epoch_ms();
        let mut probe = account.clone();
        match circuit::admit(&mut probe, now) {
            Admission::Closed => Ok(account),
            Admission::Rejected { retry_at_ms } => {
                Err(VaultError::CircuitOpen { account_id: account_id.to_owned(), retry_at_ms })
            }
            Admission::Probe if account.circuit.is_half_open => Ok(account),
            Admission::Probe => self.promote(account_id).await?.ok_or_else(|| VaultError::CircuitOpen {
                account_id: account_id.to_owned(),
                retry_at_ms: account.circuit.backoff_retry_at_ms,
            }),
        }
    }

    /// Promote every broken account whose backoff elapsed to half-open.
    /// Returns the promoted ids.
    pub async fn promote_due(&self) -> Result<Vec<String>, VaultError> {
        let now = epoch_ms();
        let mut filter = AccountFilter { statuses: vec![AccountStatus::Error], ..Default::default() };
        let mut due = Vec::new();
        loop {
            let (page, total) = self.store.list(&filter).await?;
            due.extend(
                page.iter()
                    .filter(|a| a.circuit.phase() == CircuitPhase::Broken)
                    .filter(|a| a.circuit.backoff_retry_at_ms.is_none_or(|at| now >= at))
                    .map(|a| a.id.clone()),
            );
            if page.is_empty() || filter.page * filter.page_size >= total {
                break;
            }
            filter.page += 1;
        }

        let mut promoted = Vec::with_capacity(due.len());
        for id in due {
            match self.promote(&id).await {
                Ok(Some(_)) => promoted.push(id),
                Ok(None) => {}
                Err(e) => tracing::warn!(account = %id, err = %e, "failed to promote account to half-open"),
            }
        }
        Ok(promoted)
    }

    async fn promote(&self, account_id: &str) -> Result<Option<Account>, VaultError> {
        let now = epoch_ms();
        let (account, promoted) =
            store::modify(&*self.store, account_id, |a| circuit::promote_if_due(a, now)).await?;
        if promoted {
            tracing::info!(account = %account_id, episode = account.circuit.broken_count, "circuit half-open, probing");
            return Ok(Some(account));
        }
        Ok(account.circuit.is_half_open.then_some(account))
    }

    /// Check the stored access token against the provider and record the outcome.
    pub async fn validate(&self, account_id: &str) -> Result<Validation, VaultError> {
        let account =
            self.store.get(account_id).await?.ok_or_else(|| VaultError::AccountNotFound(account_id.to_owned()))?;
        if !account.provider.is_oauth() {
            return Ok(Validation::Skipped);
        }
        let provider = match self.registry.get(account.provider) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(account = %account_id, err = %e, "skipping validation");
                return Ok(Validation::Skipped);
            }
        };

        let outcome = match self.cipher.decrypt_str(account.access_token.ciphertext()) {
            Ok(token) => provider.validate_token(&token, account.proxy.as_ref()).await,
            Err(e) => {
                tracing::error!(account = %account_id, err = %e, "cannot decrypt access token");
                Err(ProviderError::Malformed(VaultError::DecryptionFailure(e).to_string()))
            }
        };

        match outcome {
            Ok(()) => {
                self.report_success(account_id).await?;
                tracing::info!(account = %account_id, "validation passed");
                Ok(Validation::Passed)
            }
            Err(e) => {
                let terminal = e.is_terminal();
                let message = e.to_string();
                tracing::warn!(account = %account_id, terminal, err = %message, "validation failed");
                self.report_failure(account_id, terminal, &message).await?;
                Ok(Validation::Failed { terminal, message })
            }
        }
    }

    fn announce(&self, account: &Account, transition: Option<Transition>, now: u64) {
        let Some(transition) = transition else { return };
        let event = match transition {
            Transition::Broken { disabled } => {
                if disabled {
                    tracing::error!(
                        account = %account.id,
                        episodes = account.circuit.broken_count,
                        "circuit broken too many times, account disabled"
                    );
                } else {
                    tracing::warn!(
                        account = %account.id,
                        health = account.health_score,
                        episode = account.circuit.broken_count,
                        retry_at_ms = account.circuit.backoff_retry_at_ms.unwrap_or_default(),
                        "circuit broken"
                    );
                }
                CredentialEvent::CircuitBroken {
                    account_id: account.id.clone(),
                    name: account.name.clone(),
                    health_score: account.health_score,
                    broken_at_ms: account.circuit.broken_at_ms.unwrap_or(now),
                    disabled,
                }
            }
            Transition::Recovered { probe_count, recover_duration_ms } => {
                tracing::info!(account = %account.id, probe_count, recover_duration_ms, "circuit recovered");
                CredentialEvent::CircuitRecovered {
                    account_id: account.id.clone(),
                    name: account.name.clone(),
                    probe_count,
                    recover_duration_ms,
                }
            }
        };
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;

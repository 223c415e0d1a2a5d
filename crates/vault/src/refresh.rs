// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token refresh: single-account refresh with retries, expiring-batch sweeps,
//! and the background cadences that drive them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::account::{epoch_ms, Account, AccountFilter, AccountStatus, ProviderType, RefreshCadence, SealedToken};
use crate::circuit::CircuitPhase;
use crate::crypto::TokenCipher;
use crate::error::VaultError;
use crate::events::CredentialEvent;
use crate::health::HealthMonitor;
use crate::oauth::OAuthTokenSet;
use crate::provider::{ProviderError, ProviderRegistry};
use crate::store::{self, AccountStore};

/// Retry behaviour for a single refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Sleep before the first retry; doubles for each later one.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Bound on one provider call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(4),
            call_timeout: crate::provider::http::DEFAULT_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry `n` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub concurrency: usize,
    /// Bound on a whole batch; unfinished items count as failed.
    pub job_timeout: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self { concurrency: 5, job_timeout: Duration::from_secs(30 * 60) }
    }
}

/// One refresh cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub cadence: RefreshCadence,
    pub interval: Duration,
    pub lookahead: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub short: Schedule,
    pub long: Schedule,
    pub probe_interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            short: Schedule {
                cadence: RefreshCadence::Short,
                interval: Duration::from_secs(5 * 60),
                lookahead: Duration::from_secs(5 * 60),
            },
            long: Schedule {
                cadence: RefreshCadence::Long,
                interval: Duration::from_secs(6 * 3600),
                lookahead: Duration::from_secs(2 * 3600),
            },
            probe_interval: Duration::from_secs(60),
        }
    }
}

/// Outcome counts for a batch refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

type Lease = Arc<tokio::sync::Mutex<()>>;

/// Keeps OAuth access tokens fresh.
pub struct RefreshEngine {
    store: Arc<dyn AccountStore>,
    registry: Arc<ProviderRegistry>,
    cipher: Arc<TokenCipher>,
    health: Arc<HealthMonitor>,
    retry: RetryPolicy,
    batch: BatchPolicy,
    event_tx: broadcast::Sender<CredentialEvent>,
    leases: Mutex<HashMap<String, Lease>>,
}

impl RefreshEngine {
    pub fn new(
        store: Arc<dyn AccountStore>,
        registry: Arc<ProviderRegistry>,
        cipher: Arc<TokenCipher>,
        health: Arc<HealthMonitor>,
        retry: RetryPolicy,
        batch: BatchPolicy,
        event_tx: broadcast::Sender<CredentialEvent>,
    ) -> Self {
        Self { store, registry, cipher, health, retry, batch, event_tx, leases: Mutex::new(HashMap::new()) }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Refresh one account's tokens. Returns the stored account afterwards.
    pub async fn refresh_one(&self, account_id: &str) -> Result<Account, VaultError> {
        self.refresh_one_with(account_id, &CancellationToken::new()).await
    }

    /// Like [`Self::refresh_one`], aborting with [`VaultError::Cancelled`]
    /// as soon as `cancel` fires.
    pub async fn refresh_one_with(&self, account_id: &str, cancel: &CancellationToken) -> Result<Account, VaultError> {
        let lease = self.lease(account_id);
        let result = {
            let guard = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                guard = lease.lock() => Some(guard),
            };
            match guard {
                Some(_guard) => self.refresh_leased(account_id, cancel).await,
                None => Err(VaultError::Cancelled),
            }
        };
        drop(lease);
        self.release(account_id);
        if matches!(result, Err(VaultError::Cancelled)) {
            tracing::debug!(account = %account_id, "refresh cancelled");
        }
        result
    }

    fn lease(&self, account_id: &str) -> Lease {
        Arc::clone(self.leases.lock().entry(account_id.to_owned()).or_default())
    }

    /// Drop the lease entry once nobody else holds or waits on it.
    fn release(&self, account_id: &str) {
        let mut leases = self.leases.lock();
        if leases.get(account_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            leases.remove(account_id);
        }
    }

    async fn refresh_leased(&self, account_id: &str, cancel: &CancellationToken) -> Result<Account, VaultError> {
        let account = self.health.admit(account_id).await?;
        let provider = self.registry.get(account.provider)?;

        let now = epoch_ms();
        let (account, ()) =
            store::modify(&*self.store, account_id, |a| a.last_refresh_attempt_at_ms = Some(now)).await?;

        let refresh_token = match self.cipher.decrypt_str(account.refresh_token.ciphertext()) {
            Ok(token) => token,
            Err(e) => {
                return Err(self.fail(account_id, VaultError::DecryptionFailure(e)).await);
            }
        };

        let mut attempt = 0;
        let tokens = loop {
            attempt += 1;
            let call = tokio::time::timeout(
                self.retry.call_timeout,
                provider.refresh_token(&refresh_token, account.proxy.as_ref()),
            );
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(VaultError::Cancelled),
                result = call => result.unwrap_or_else(|_| {
                    Err(ProviderError::transient(format!("timed out after {:?}", self.retry.call_timeout)))
                }),
            };
            match outcome {
                Ok(tokens) => break tokens,
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let backoff = self.retry.backoff_for(attempt);
                    tracing::warn!(
                        account = %account_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        err = %e,
                        "refresh attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(VaultError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => return Err(self.fail(account_id, classify(e, attempt)).await),
            }
        };

        self.store_tokens(&account, tokens, &refresh_token).await
    }

    async fn store_tokens(
        &self,
        account: &Account,
        tokens: OAuthTokenSet,
        previous_refresh: &str,
    ) -> Result<Account, VaultError> {
        let account_id = account.id.as_str();
        if tokens.access_token.is_empty() {
            let err = VaultError::RefreshRejected { status: None, message: "empty access token".to_owned() };
            return Err(self.fail(account_id, err).await);
        }
        let now = epoch_ms();
        let expires_at_ms = now.saturating_add(tokens.expires_in_secs_or_default().saturating_mul(1000));
        if expires_at_ms <= now {
            let err = VaultError::RefreshRejected { status: None, message: "token already expired".to_owned() };
            return Err(self.fail(account_id, err).await);
        }

        let (access, refresh, id_token) = match self.seal_tokens(&tokens, previous_refresh) {
            Ok(sealed) => sealed,
            Err(e) => return Err(self.fail(account_id, e).await),
        };

        store::modify(&*self.store, account_id, |a| {
            a.access_token = access.clone();
            a.refresh_token = refresh.clone();
            if let Some(ref id_token) = id_token {
                a.id_token = Some(id_token.clone());
            }
            if !tokens.organizations.is_empty() {
                a.organizations = tokens.organizations.clone();
            }
            a.token_expires_at_ms = Some(expires_at_ms);
        })
        .await?;

        let account = self.health.report_success(account_id).await?;
        tracing::info!(
            account = %account_id,
            provider = %account.provider,
            rotated = tokens.refresh_token.is_some(),
            expires_at_ms,
            "tokens refreshed"
        );
        let _ = self.event_tx.send(CredentialEvent::Refreshed { account_id: account_id.to_owned(), expires_at_ms });
        Ok(account)
    }

    /// Report a failed refresh to health and announce it. Returns `err`.
    /// Encrypt a refreshed set; a refresh response without a new refresh
    /// token keeps `previous_refresh`.
    fn seal_tokens(
        &self,
        tokens: &OAuthTokenSet,
        previous_refresh: &str,
    ) -> Result<(SealedToken, SealedToken, Option<SealedToken>), VaultError> {
        let seal = |plain: &str| {
            self.cipher.encrypt_str(plain).map(SealedToken::from_ciphertext).map_err(VaultError::EncryptionFailure)
        };
        let access = seal(&tokens.access_token)?;
        let refresh = seal(tokens.refresh_token.as_deref().filter(|t| !t.is_empty()).unwrap_or(previous_refresh))?;
        let id_token = tokens.id_token.as_deref().map(seal).transpose()?;
        Ok((access, refresh, id_token))
    }

    async fn fail(&self, account_id: &str, err: VaultError) -> VaultError {
        let terminal = matches!(err, VaultError::RefreshTokenInvalid(_));
        let message = err.to_string();
        match err {
            VaultError::RefreshTokenInvalid(_) => {
                tracing::error!(account = %account_id, err = %message, "refresh token revoked");
            }
            VaultError::RefreshTransientFailure { attempts, .. } => {
                tracing::error!(account = %account_id, attempts, err = %message, "refresh retries exhausted");
            }
            VaultError::EncryptionFailure(_) | VaultError::DecryptionFailure(_) => {
                tracing::error!(account = %account_id, err = %message, "token crypto failed");
            }
            _ => tracing::warn!(account = %account_id, err = %message, "refresh failed"),
        }
        if let Err(e) = self.health.report_failure(account_id, terminal, &message).await {
            tracing::warn!(account = %account_id, err = %e, "failed to record refresh failure");
        }
        let _ = self.event_tx.send(CredentialEvent::RefreshFailed {
            account_id: account_id.to_owned(),
            error: message,
            terminal,
        });
        err
    }

    /// Refresh every serveable OAuth account expiring within `lookahead`.
    pub async fn refresh_expiring(&self, lookahead: Duration) -> Result<RefreshSummary, VaultError> {
        self.refresh_expiring_for(lookahead, &ProviderType::OAUTH).await
    }

    /// [`Self::refresh_expiring`] restricted to `providers`.
    pub async fn refresh_expiring_for(
        &self,
        lookahead: Duration,
        providers: &[ProviderType],
    ) -> Result<RefreshSummary, VaultError> {
        self.sweep_expiring(lookahead, providers, &CancellationToken::new()).await
    }

    /// Promote broken accounts whose backoff elapsed and run one trial
    /// refresh for each half-open account.
    pub async fn probe_broken(&self) -> Result<RefreshSummary, VaultError> {
        self.sweep_broken(&CancellationToken::new()).await
    }

    async fn sweep_expiring(
        &self,
        lookahead: Duration,
        providers: &[ProviderType],
        stop: &CancellationToken,
    ) -> Result<RefreshSummary, VaultError> {
        let providers: Vec<ProviderType> = providers.iter().copied().filter(ProviderType::is_oauth).collect();
        if providers.is_empty() {
            return Ok(RefreshSummary::default());
        }
        let filter = AccountFilter {
            statuses: vec![AccountStatus::Active, AccountStatus::Created],
            provider_types: providers,
            expires_before_ms: Some(epoch_ms().saturating_add(lookahead.as_millis() as u64)),
            ..Default::default()
        };
        let ids = self.collect_ids(filter, |_| true).await?;
        Ok(self.run_batch(ids, stop).await)
    }

    async fn sweep_broken(&self, stop: &CancellationToken) -> Result<RefreshSummary, VaultError> {
        self.health.promote_due().await?;
        let filter = AccountFilter { statuses: vec![AccountStatus::Error], ..Default::default() };
        let ids = self.collect_ids(filter, |a| a.circuit.phase() == CircuitPhase::HalfOpen).await?;
        Ok(self.run_batch(ids, stop).await)
    }

    /// Snapshot matching ids up front; refreshing moves accounts between
    /// pages.
    async fn collect_ids(
        &self,
        mut filter: AccountFilter,
        keep: impl Fn(&Account) -> bool,
    ) -> Result<Vec<String>, VaultError> {
        let mut ids = Vec::new();
        loop {
            let (page, total) = self.store.list(&filter).await?;
            ids.extend(page.iter().filter(|a| keep(a)).map(|a| a.id.clone()));
            if page.is_empty() || filter.page.saturating_mul(filter.page_size) >= total {
                break;
            }
            filter.page += 1;
        }
        Ok(ids)
    }

    /// Refresh `ids` with bounded concurrency.
    ///
    /// Once the job timeout passes or `stop` fires, no further items start.
    /// Items already running finish and persist whatever the provider issued;
    /// a rotated refresh token is single-use and must not be lost.
    async fn run_batch(&self, ids: Vec<String>, stop: &CancellationToken) -> RefreshSummary {
        let total = ids.len();
        if total == 0 {
            return RefreshSummary::default();
        }
        let drain = stop.child_token();
        let mut succeeded = 0;
        let mut skipped = 0usize;
        {
            let job = futures_util::stream::iter(ids)
                .map(|id| {
                    let drain = drain.clone();
                    async move {
                        if drain.is_cancelled() {
                            return (id, Err(VaultError::Cancelled));
                        }
                        let result = self.refresh_one(&id).await;
                        (id, result)
                    }
                })
                .buffer_unordered(self.batch.concurrency.max(1))
                .for_each(|(id, result)| {
                    match result {
                        Ok(_) => succeeded += 1,
                        Err(VaultError::Cancelled) => skipped += 1,
                        Err(e) => tracing::warn!(account = %id, err = %e, "batch refresh item failed"),
                    }
                    std::future::ready(())
                });
            tokio::pin!(job);
            tokio::select! {
                _ = &mut job => {}
                _ = tokio::time::sleep(self.batch.job_timeout) => {
                    tracing::warn!(timeout = ?self.batch.job_timeout, "batch refresh timed out, finishing started items");
                    drain.cancel();
                    job.await;
                }
            }
        }
        let summary = RefreshSummary { total, succeeded, failed: total - succeeded };
        tracing::info!(total, succeeded, failed = summary.failed, skipped, "batch refresh finished");
        summary
    }

    /// Spawn the short and long refresh cadences plus the probe loop.
    pub fn spawn_schedules(
        self: &Arc<Self>,
        schedule: ScheduleConfig,
        shutdown: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(3);
        for cadence in [schedule.short, schedule.long] {
            let engine = Arc::clone(self);
            let shutdown = shutdown.clone();
            let providers = ProviderType::with_cadence(cadence.cadence);
            handles.push(tokio::spawn(async move {
                let mut timer = tokio::time::interval(cadence.interval);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = timer.tick() => {}
                    }
                    tracing::debug!(cadence = ?cadence.cadence, "refresh tick");
                    // Shutdown stops new items; started refreshes still persist.
                    if let Err(e) = engine.sweep_expiring(cadence.lookahead, &providers, &shutdown).await {
                        tracing::warn!(cadence = ?cadence.cadence, err = %e, "refresh sweep failed");
                    }
                }
            }));
        }

        let engine = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut timer = tokio::time::interval(schedule.probe_interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer.tick() => {}
                }
                tracing::debug!("probe tick");
                if let Err(e) = engine.sweep_broken(&shutdown).await {
                    tracing::warn!(err = %e, "probe sweep failed");
                }
            }
        }));
        handles
    }
}

/// Map a provider failure after `attempts` calls to the refresh error.
fn classify(err: ProviderError, attempts: u32) -> VaultError {
    match err {
        ProviderError::InvalidGrant { message, .. } => VaultError::RefreshTokenInvalid(message),
        ProviderError::Transient { message, .. } => VaultError::RefreshTransientFailure { attempts, message },
        ProviderError::Unauthorized { status, message } | ProviderError::Rejected { status, message } => {
            VaultError::RefreshRejected { status: Some(status), message }
        }
        ProviderError::Malformed(message) => VaultError::RefreshRejected { status: None, message },
    }
}

#[cfg(test)]
#[path = "refresh_tests.rs"]
mod tests;

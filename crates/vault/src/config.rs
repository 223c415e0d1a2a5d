// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use crate::account::{ProviderType, RefreshCadence};
use crate::circuit::CircuitPolicy;
use crate::crypto::TokenCipher;
use crate::provider::{defaults, HttpClients, OAuthProvider, ProviderRegistry};
use crate::refresh::{BatchPolicy, RetryPolicy, Schedule, ScheduleConfig};
use crate::store::{AccountStore, FileAccountStore, MemoryAccountStore};

/// Configuration for the credential vault.
///
/// Meant to be `#[command(flatten)]`ed into a host binary's CLI.
#[derive(Debug, Clone, clap::Args)]
pub struct VaultConfig {
    /// Base64-encoded 32-byte AES-256-GCM key for tokens at rest.
    #[arg(long, env = "COOP_VAULT_ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: Option<String>,

    /// Path to the JSON account store. Accounts are kept in memory when unset.
    #[arg(long, env = "COOP_VAULT_ACCOUNTS_PATH")]
    pub accounts_path: Option<std::path::PathBuf>,

    /// Lifetime of a pending authorization session in seconds.
    #[arg(long, default_value_t = 600, env = "COOP_VAULT_SESSION_TTL_SECS")]
    pub session_ttl_secs: u64,

    /// Timeout for a single upstream provider call in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "COOP_VAULT_PROVIDER_TIMEOUT_MS")]
    pub provider_timeout_ms: u64,

    /// Attempts per refresh before giving up on transient errors.
    #[arg(long, default_value_t = 3, env = "COOP_VAULT_REFRESH_ATTEMPTS")]
    pub refresh_attempts: u32,

    /// Backoff before the first refresh retry in milliseconds (doubles each retry).
    #[arg(long, default_value_t = 1000, env = "COOP_VAULT_REFRESH_BACKOFF_MS")]
    pub refresh_backoff_ms: u64,

    /// Upper bound on refresh retry backoff in milliseconds.
    #[arg(long, default_value_t = 4000, env = "COOP_VAULT_REFRESH_BACKOFF_MAX_MS")]
    pub refresh_backoff_max_ms: u64,

    /// Accounts refreshed concurrently by a batch.
    #[arg(long, default_value_t = 5, env = "COOP_VAULT_BATCH_CONCURRENCY")]
    pub batch_concurrency: usize,

    /// Upper bound on one batch refresh job in seconds.
    #[arg(long, default_value_t = 1800, env = "COOP_VAULT_BATCH_TIMEOUT_SECS")]
    pub batch_timeout_secs: u64,

    /// Check interval for short-lived-token providers in seconds.
    #[arg(long, default_value_t = 300, env = "COOP_VAULT_SHORT_INTERVAL_SECS")]
    pub short_interval_secs: u64,

    /// Expiry lookahead for short-lived-token providers in seconds.
    #[arg(long, default_value_t = 300, env = "COOP_VAULT_SHORT_LOOKAHEAD_SECS")]
    pub short_lookahead_secs: u64,

    /// Check interval for long-lived-token providers in seconds.
    #[arg(long, default_value_t = 21_600, env = "COOP_VAULT_LONG_INTERVAL_SECS")]
    pub long_interval_secs: u64,

    /// Expiry lookahead for long-lived-token providers in seconds.
    #[arg(long, default_value_t = 7200, env = "COOP_VAULT_LONG_LOOKAHEAD_SECS")]
    pub long_lookahead_secs: u64,

    /// How often broken accounts are checked for a due probe, in seconds.
    #[arg(long, default_value_t = 60, env = "COOP_VAULT_PROBE_INTERVAL_SECS")]
    pub probe_interval_secs: u64,

    /// Consecutive failures that break an account's circuit.
    #[arg(long, default_value_t = 3, env = "COOP_VAULT_FAILURE_THRESHOLD")]
    pub failure_threshold: u32,

    /// Health points lost per failure.
    #[arg(long, default_value_t = 20, env = "COOP_VAULT_FAILURE_PENALTY")]
    pub failure_penalty: u8,

    /// Health points regained per success while closed.
    #[arg(long, default_value_t = 10, env = "COOP_VAULT_RECOVERY_STEP")]
    pub recovery_step: u8,

    /// Probe successes needed to close a half-open circuit.
    #[arg(long, default_value_t = 1, env = "COOP_VAULT_PROBE_SUCCESSES")]
    pub probe_successes: u32,

    /// Circuit backoff for the first broken episode in seconds (doubles per episode).
    #[arg(long, default_value_t = 60, env = "COOP_VAULT_CIRCUIT_BACKOFF_SECS")]
    pub circuit_backoff_secs: u64,

    /// Upper bound on circuit backoff in seconds.
    #[arg(long, default_value_t = 3600, env = "COOP_VAULT_CIRCUIT_BACKOFF_MAX_SECS")]
    pub circuit_backoff_max_secs: u64,

    /// Broken episodes tolerated before an account is disabled.
    #[arg(long, default_value_t = 5, env = "COOP_VAULT_DISABLE_AFTER_EPISODES")]
    pub disable_after_episodes: u32,

    /// OAuth client secret for Gemini (installed-app client).
    #[arg(long, env = "COOP_VAULT_GEMINI_CLIENT_SECRET", hide_env_values = true)]
    pub gemini_client_secret: Option<String>,
}

impl VaultConfig {
    /// Reject values that would stall or disable the engine.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.refresh_attempts == 0 {
            anyhow::bail!("refresh_attempts must be at least 1");
        }
        if self.batch_concurrency == 0 {
            anyhow::bail!("batch_concurrency must be at least 1");
        }
        if self.failure_threshold == 0 {
            anyhow::bail!("failure_threshold must be at least 1");
        }
        if self.probe_successes == 0 {
            anyhow::bail!("probe_successes must be at least 1");
        }
        for (name, secs) in [
            ("short_interval_secs", self.short_interval_secs),
            ("long_interval_secs", self.long_interval_secs),
            ("probe_interval_secs", self.probe_interval_secs),
            ("session_ttl_secs", self.session_ttl_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("{name} must be greater than zero");
            }
        }
        if self.refresh_backoff_max_ms < self.refresh_backoff_ms {
            anyhow::bail!("refresh_backoff_max_ms must not be below refresh_backoff_ms");
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.refresh_attempts,
            initial_backoff: Duration::from_millis(self.refresh_backoff_ms),
            max_backoff: Duration::from_millis(self.refresh_backoff_max_ms),
            call_timeout: self.provider_timeout(),
        }
    }

    pub fn batch_policy(&self) -> BatchPolicy {
        BatchPolicy {
            concurrency: self.batch_concurrency,
            job_timeout: Duration::from_secs(self.batch_timeout_secs),
        }
    }

    pub fn circuit_policy(&self) -> CircuitPolicy {
        CircuitPolicy {
            failure_threshold: self.failure_threshold,
            failure_penalty: self.failure_penalty,
            recovery_step: self.recovery_step,
            probe_success_threshold: self.probe_successes,
            backoff_base: Duration::from_secs(self.circuit_backoff_secs),
            backoff_max: Duration::from_secs(self.circuit_backoff_max_secs),
            disable_after_episodes: self.disable_after_episodes,
        }
    }

    pub fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig {
            short: Schedule {
                cadence: RefreshCadence::Short,
                interval: Duration::from_secs(self.short_interval_secs),
                lookahead: Duration::from_secs(self.short_lookahead_secs),
            },
            long: Schedule {
                cadence: RefreshCadence::Long,
                interval: Duration::from_secs(self.long_interval_secs),
                lookahead: Duration::from_secs(self.long_lookahead_secs),
            },
            probe_interval: Duration::from_secs(self.probe_interval_secs),
        }
    }

    /// Decode the configured encryption key.
    pub fn cipher(&self) -> anyhow::Result<TokenCipher> {
        let key = self
            .encryption_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("COOP_VAULT_ENCRYPTION_KEY is not set"))?;
        Ok(TokenCipher::from_base64_key(key)?)
    }

    /// Open the configured account store.
    pub fn account_store(&self) -> anyhow::Result<Arc<dyn AccountStore>> {
        match &self.accounts_path {
            Some(path) => Ok(Arc::new(FileAccountStore::open(path)?)),
            None => Ok(Arc::new(MemoryAccountStore::new())),
        }
    }

    /// Registry with the built-in providers and any configured overrides.
    pub fn registry(&self) -> ProviderRegistry {
        let http = Arc::new(HttpClients::new(self.provider_timeout()));
        let registry = ProviderRegistry::new();
        for kind in ProviderType::OAUTH {
            let Some(mut endpoints) = defaults::endpoints_for(kind) else { continue };
            if kind == ProviderType::Gemini {
                endpoints.client_secret = self.gemini_client_secret.clone();
            }
            registry.register(Arc::new(OAuthProvider::new(kind, endpoints, Arc::clone(&http))));
        }
        registry
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

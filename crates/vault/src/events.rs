// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential lifecycle events for observers (router, dashboards, alerting).

use serde::{Deserialize, Serialize};

use crate::account::{AccountStatus, ProviderType};

/// Events emitted on the vault's broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CredentialEvent {
    /// A new account was created from a completed authorization.
    Provisioned { account_id: String, name: String, provider: ProviderType, status: AccountStatus },
    /// Tokens were refreshed successfully.
    Refreshed { account_id: String, expires_at_ms: u64 },
    /// A refresh gave up (terminal failure or retries exhausted).
    RefreshFailed { account_id: String, error: String, terminal: bool },
    /// The account's circuit opened (again). `disabled` marks the final trip.
    CircuitBroken {
        account_id: String,
        name: String,
        health_score: u8,
        broken_at_ms: u64,
        disabled: bool,
    },
    /// A half-open account passed its probes and is serving again.
    CircuitRecovered { account_id: String, name: String, probe_count: u32, recover_duration_ms: u64 },
}

impl CredentialEvent {
    pub fn account_id(&self) -> &str {
        match self {
            Self::Provisioned { account_id, .. }
            | Self::Refreshed { account_id, .. }
            | Self::RefreshFailed { account_id, .. }
            | Self::CircuitBroken { account_id, .. }
            | Self::CircuitRecovered { account_id, .. } => account_id,
        }
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;

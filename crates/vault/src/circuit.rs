// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-account circuit breaker state machine.
//!
//! Closed -> Broken after repeated (or one terminal) failure, Broken ->
//! HalfOpen once the backoff deadline passes, HalfOpen -> Closed after enough
//! probe successes or back to Broken with a longer backoff. Too many broken
//! episodes without recovery disable the account.
//!
//! Everything here is pure: callers pass `now_ms` and persist the mutated
//! account themselves.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::account::{Account, AccountStatus, MAX_HEALTH};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    pub is_broken: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken_at_ms: Option<u64>,
    /// Implies `is_broken`.
    pub is_half_open: bool,
    pub consecutive_failures: u32,
    pub probe_success_count: u32,
    /// Only meaningful while broken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_retry_at_ms: Option<u64>,
    /// Broken episodes since the last full recovery.
    #[serde(default)]
    pub broken_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPhase {
    Closed,
    Broken,
    HalfOpen,
}

impl CircuitState {
    pub fn phase(&self) -> CircuitPhase {
        match (self.is_broken, self.is_half_open) {
            (false, _) => CircuitPhase::Closed,
            (true, false) => CircuitPhase::Broken,
            (true, true) => CircuitPhase::HalfOpen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitPolicy {
    pub failure_threshold: u32,
    pub failure_penalty: u8,
    pub recovery_step: u8,
    pub probe_success_threshold: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Broken episodes tolerated before the account is disabled.
    pub disable_after_episodes: u32,
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_penalty: 20,
            recovery_step: 10,
            probe_success_threshold: 1,
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(3600),
            disable_after_episodes: 5,
        }
    }
}

impl CircuitPolicy {
    /// Backoff for the given episode: `base * 2^(episode - 1)`, capped.
    pub fn backoff_for(&self, episode: u32) -> Duration {
        let exp = episode.saturating_sub(1).min(31);
        self.backoff_base.saturating_mul(1u32 << exp).min(self.backoff_max)
    }
}

/// Circuit transition worth announcing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Broken { disabled: bool },
    Recovered { probe_count: u32, recover_duration_ms: u64 },
}

/// Outcome of gating an account before an upstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Closed,
    /// Half-open: this call is a trial probe.
    Probe,
    Rejected { retry_at_ms: Option<u64> },
}

pub fn record_success(account: &mut Account, policy: &CircuitPolicy, now_ms: u64) -> Option<Transition> {
    if account.status == AccountStatus::Disabled {
        return None;
    }
    account.circuit.consecutive_failures = 0;

    match account.circuit.phase() {
        CircuitPhase::Closed => {}
        // Only trial calls admitted after the backoff count toward recovery.
        CircuitPhase::Broken => return None,
        CircuitPhase::HalfOpen => return record_probe_success(account, policy, now_ms),
    }

    account.health_score = account.health_score.saturating_add(policy.recovery_step).min(MAX_HEALTH);
    if matches!(account.status, AccountStatus::Created | AccountStatus::Error) {
        account.status = AccountStatus::Active;
    }
    None
}

fn record_probe_success(account: &mut Account, policy: &CircuitPolicy, now_ms: u64) -> Option<Transition> {
    account.circuit.probe_success_count += 1;
    if account.circuit.probe_success_count < policy.probe_success_threshold {
        return None;
    }
    let probe_count = account.circuit.probe_success_count;
    let recover_duration_ms = account.circuit.broken_at_ms.map(|at| now_ms.saturating_sub(at)).unwrap_or(0);
    account.circuit = CircuitState::default();
    account.health_score = MAX_HEALTH;
    account.status = AccountStatus::Active;
    Some(Transition::Recovered { probe_count, recover_duration_ms })
}

pub fn record_failure(
    account: &mut Account,
    policy: &CircuitPolicy,
    terminal: bool,
    now_ms: u64,
) -> Option<Transition> {
    account.health_score = account.health_score.saturating_sub(policy.failure_penalty);
    if account.status == AccountStatus::Disabled {
        return None;
    }
    account.circuit.consecutive_failures = account.circuit.consecutive_failures.saturating_add(1);

    match account.circuit.phase() {
        CircuitPhase::Broken => None,
        CircuitPhase::HalfOpen => Some(trip(account, policy, now_ms)),
        CircuitPhase::Closed => {
            if terminal || account.circuit.consecutive_failures >= policy.failure_threshold {
                Some(trip(account, policy, now_ms))
            } else {
                None
            }
        }
    }
}

fn trip(account: &mut Account, policy: &CircuitPolicy, now_ms: u64) -> Transition {
    let circuit = &mut account.circuit;
    circuit.is_broken = true;
    circuit.is_half_open = false;
    circuit.probe_success_count = 0;
    circuit.broken_at_ms = Some(now_ms);
    circuit.broken_count = circuit.broken_count.saturating_add(1);
    let backoff = policy.backoff_for(circuit.broken_count);
    circuit.backoff_retry_at_ms = Some(now_ms.saturating_add(backoff.as_millis() as u64));

    let disabled = circuit.broken_count > policy.disable_after_episodes;
    account.status = if disabled { AccountStatus::Disabled } else { AccountStatus::Error };
    Transition::Broken { disabled }
}

/// Move a broken account into half-open once its backoff deadline passed.
pub fn promote_if_due(account: &mut Account, now_ms: u64) -> bool {
    let circuit = &mut account.circuit;
    if account.status == AccountStatus::Disabled || circuit.phase() != CircuitPhase::Broken {
        return false;
    }
    if circuit.backoff_retry_at_ms.is_some_and(|at| now_ms < at) {
        return false;
    }
    circuit.is_half_open = true;
    circuit.probe_success_count = 0;
    true
}

/// Gate an upstream call. May promote the account to half-open.
pub fn admit(account: &mut Account, now_ms: u64) -> Admission {
    if account.status == AccountStatus::Disabled {
        return Admission::Rejected { retry_at_ms: None };
    }
    match account.circuit.phase() {
        CircuitPhase::Closed => Admission::Closed,
        CircuitPhase::HalfOpen => Admission::Probe,
        CircuitPhase::Broken => {
            if promote_if_due(account, now_ms) {
                Admission::Probe
            } else {
                Admission::Rejected { retry_at_ms: account.circuit.backoff_retry_at_ms }
            }
        }
    }
}

#[cfg(test)]
#[path = "circuit_tests.rs"]
mod tests;

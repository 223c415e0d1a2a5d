// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pooled upstream account model.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::circuit::CircuitState;

/// Upstream provider an account belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Claude,
    #[serde(rename = "openai")]
    OpenAi,
    Gemini,
    AnthropicApiKey,
    #[serde(rename = "openai_api_key")]
    OpenAiApiKey,
    GeminiApiKey,
}

/// How soon before expiry a provider's tokens need refreshing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshCadence {
    /// Access tokens live for hours; checked frequently with a short lookahead.
    Short,
    /// Access tokens live for days; checked rarely with a long lookahead.
    Long,
}

impl ProviderType {
    pub const OAUTH: [ProviderType; 3] = [Self::Claude, Self::OpenAi, Self::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::AnthropicApiKey => "anthropic_api_key",
            Self::OpenAiApiKey => "openai_api_key",
            Self::GeminiApiKey => "gemini_api_key",
        }
    }

    /// OAuth accounts hold refreshable tokens; API-key accounts are static.
    pub fn is_oauth(&self) -> bool {
        matches!(self, Self::Claude | Self::OpenAi | Self::Gemini)
    }

    /// `None` for API-key providers, which are never refreshed.
    pub fn refresh_cadence(&self) -> Option<RefreshCadence> {
        match self {
            Self::Claude | Self::Gemini => Some(RefreshCadence::Short),
            Self::OpenAi => Some(RefreshCadence::Long),
            _ => None,
        }
    }

    pub fn with_cadence(cadence: RefreshCadence) -> Vec<ProviderType> {
        Self::OAUTH.into_iter().filter(|p| p.refresh_cadence() == Some(cadence)).collect()
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "claude" | "anthropic" => Ok(Self::Claude),
            "openai" | "codex" => Ok(Self::OpenAi),
            "gemini" | "google" => Ok(Self::Gemini),
            "anthropic_api_key" => Ok(Self::AnthropicApiKey),
            "openai_api_key" => Ok(Self::OpenAiApiKey),
            "gemini_api_key" => Ok(Self::GeminiApiKey),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Provisioned but not yet validated.
    Created,
    Active,
    /// Circuit is broken; recovers through probing.
    Error,
    /// Terminal for automatic refresh. Needs operator action.
    Disabled,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Error => "error",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encrypted token material as produced by [`crate::crypto::TokenCipher`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedToken(String);

impl SealedToken {
    pub fn from_ciphertext(ciphertext: String) -> Self {
        Self(ciphertext)
    }

    pub fn ciphertext(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SealedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealedToken(..)")
    }
}

/// Outbound proxy for all upstream calls made on behalf of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// `http://`, `https://`, `socks5://` or `socks5h://`, credentials inline.
    pub url: String,
}

impl ProxyConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm: Option<u32>,
}

pub const MAX_HEALTH: u8 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub provider: ProviderType,
    pub status: AccountStatus,
    pub health_score: u8,
    pub access_token: SealedToken,
    pub refresh_token: SealedToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<SealedToken>,
    /// Epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expires_at_ms: Option<u64>,
    #[serde(default)]
    pub organizations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub rate_limits: RateLimits,
    #[serde(default)]
    pub circuit: CircuitState,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh_attempt_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Bumped by the store on every successful update.
    #[serde(default)]
    pub version: u64,
}

impl Account {
    /// Whether the router may send traffic through this account.
    pub fn is_serveable(&self) -> bool {
        self.status == AccountStatus::Active && !self.circuit.is_broken
    }

    pub fn expires_within(&self, now_ms: u64, window_ms: u64) -> bool {
        self.token_expires_at_ms.is_some_and(|exp| exp <= now_ms.saturating_add(window_ms))
    }
}

/// Filter for [`crate::store::AccountStore::list`]. Empty vectors match anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountFilter {
    pub statuses: Vec<AccountStatus>,
    pub provider_types: Vec<ProviderType>,
    pub expires_before_ms: Option<u64>,
    /// 1-based.
    pub page: usize,
    pub page_size: usize,
}

impl Default for AccountFilter {
    fn default() -> Self {
        Self {
            statuses: vec![],
            provider_types: vec![],
            expires_before_ms: None,
            page: 1,
            page_size: 100,
        }
    }
}

impl AccountFilter {
    pub fn matches(&self, account: &Account) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&account.status) {
            return false;
        }
        if !self.provider_types.is_empty() && !self.provider_types.contains(&account.provider) {
            return false;
        }
        match self.expires_before_ms {
            Some(limit) => account.token_expires_at_ms.is_some_and(|exp| exp <= limit),
            None => true,
        }
    }
}

pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
#[path = "account_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Provider capabilities and the registry that dispatches to them.

pub mod defaults;
pub mod http;
pub mod oauth;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::account::{ProviderType, ProxyConfig};
use crate::error::VaultError;
use crate::oauth::{OAuthTokenSet, TokenErrorResponse};

pub use http::HttpClients;
pub use oauth::{OAuthProvider, ProviderEndpoints};

/// Inputs for building an authorization URL.
#[derive(Debug, Clone, Copy)]
pub struct AuthUrlParams<'a> {
    pub code_challenge: &'a str,
    pub state: &'a str,
    pub redirect_uri: &'a str,
    pub scopes: &'a [String],
}

/// Inputs for exchanging an authorization code.
#[derive(Clone, Copy)]
pub struct CodeExchange<'a> {
    pub code: &'a str,
    pub code_verifier: &'a str,
    pub redirect_uri: &'a str,
    pub state: &'a str,
}

/// Upstream failure, classified by what the caller should do about it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The grant (refresh token or code) is no longer valid.
    #[error("invalid_grant ({status}): {message}")]
    InvalidGrant { status: u16, message: String },
    /// The access token was refused outright.
    #[error("unauthorized ({status}): {message}")]
    Unauthorized { status: u16, message: String },
    /// Any other client error. Retrying will not help.
    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    /// Network error, timeout, 429, or 5xx.
    #[error("transient failure: {message}")]
    Transient { status: Option<u16>, message: String },
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient { status: None, message: message.into() }
    }

    /// Classify a non-success token endpoint response.
    pub fn from_response(status: u16, body: &str) -> Self {
        if status == 429 || status >= 500 {
            return Self::Transient { status: Some(status), message: truncate(body) };
        }
        let parsed = serde_json::from_str::<TokenErrorResponse>(body).ok().filter(|e| !e.error.is_empty());
        match parsed {
            Some(err) if err.is_invalid_grant() => Self::InvalidGrant { status, message: err.message() },
            Some(err) => Self::Rejected { status, message: err.message() },
            None => Self::Rejected { status, message: truncate(body) },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// The credential itself is dead; the circuit should break immediately.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::InvalidGrant { .. } | Self::Unauthorized { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::InvalidGrant { status, .. }
            | Self::Unauthorized { status, .. }
            | Self::Rejected { status, .. } => Some(*status),
            Self::Transient { status, .. } => *status,
            Self::Malformed(_) => None,
        }
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 512;
    let body = body.trim();
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_owned(),
    }
}

/// OAuth capabilities of one upstream provider.
#[async_trait]
pub trait Provider: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    fn default_redirect_uri(&self) -> &str;

    fn default_scopes(&self) -> &[String];

    fn build_auth_url(&self, params: &AuthUrlParams<'_>) -> String;

    async fn exchange_code(
        &self,
        exchange: &CodeExchange<'_>,
        proxy: Option<&ProxyConfig>,
    ) -> Result<OAuthTokenSet, ProviderError>;

    async fn refresh_token(
        &self,
        refresh_token: &str,
        proxy: Option<&ProxyConfig>,
    ) -> Result<OAuthTokenSet, ProviderError>;

    async fn validate_token(&self, access_token: &str, proxy: Option<&ProxyConfig>) -> Result<(), ProviderError>;
}

/// Provider lookup by type. Registration may happen at any time.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<ProviderType, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in Claude, OpenAI, and Gemini providers.
    pub fn with_defaults(http: Arc<HttpClients>) -> Self {
        let registry = Self::new();
        for kind in ProviderType::OAUTH {
            if let Some(endpoints) = defaults::endpoints_for(kind) {
                registry.register(Arc::new(OAuthProvider::new(kind, endpoints, Arc::clone(&http))));
            }
        }
        registry
    }

    /// Add or replace the provider for its type.
    pub fn register(&self, provider: Arc<dyn Provider>) {
        let kind = provider.provider_type();
        tracing::debug!(provider = %kind, "registered provider");
        self.providers.write().insert(kind, provider);
    }

    pub fn get(&self, kind: ProviderType) -> Result<Arc<dyn Provider>, VaultError> {
        self.providers.read().get(&kind).cloned().ok_or(VaultError::ProviderNotRegistered(kind))
    }

    pub fn contains(&self, kind: ProviderType) -> bool {
        self.providers.read().contains_key(&kind)
    }

    pub fn registered(&self) -> Vec<ProviderType> {
        let mut kinds: Vec<_> = self.providers.read().keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;

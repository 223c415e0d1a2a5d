// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use crate::account::ProviderType;
use crate::crypto::CryptoError;

/// Errors surfaced by the credential lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("failed to persist authorization session: {0}")]
    SessionPersist(String),

    #[error("authorization session not found or already used")]
    SessionNotFound,

    #[error("authorization session expired")]
    SessionExpired,

    #[error("state parameter does not match the authorization session")]
    StateMismatch,

    #[error("no authorization code found in input")]
    InvalidCode,

    #[error("token exchange failed{}: {message}", status_suffix(.status))]
    TokenExchangeFailed { status: Option<u16>, message: String },

    #[error("incomplete token response: {0}")]
    IncompleteTokenResponse(String),

    #[error("refresh token rejected by provider: {0}")]
    RefreshTokenInvalid(String),

    #[error("refresh failed after {attempts} attempts: {message}")]
    RefreshTransientFailure { attempts: u32, message: String },

    #[error("refresh rejected{}: {message}", status_suffix(.status))]
    RefreshRejected { status: Option<u16>, message: String },

    #[error("token encryption failed: {0}")]
    EncryptionFailure(#[source] CryptoError),

    #[error("token decryption failed: {0}")]
    DecryptionFailure(#[source] CryptoError),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("circuit open for account {account_id}")]
    CircuitOpen { account_id: String, retry_at_ms: Option<u64> },

    #[error("no provider registered for {0}")]
    ProviderNotRegistered(ProviderType),

    #[error("account {0} was modified concurrently")]
    VersionConflict(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl VaultError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionPersist(_) => "SESSION_PERSIST_ERROR",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::StateMismatch => "STATE_MISMATCH",
            Self::InvalidCode => "INVALID_CODE",
            Self::TokenExchangeFailed { .. } => "TOKEN_EXCHANGE_FAILED",
            Self::IncompleteTokenResponse(_) => "INCOMPLETE_TOKEN_RESPONSE",
            Self::RefreshTokenInvalid(_) => "REFRESH_TOKEN_INVALID",
            Self::RefreshTransientFailure { .. } => "REFRESH_TRANSIENT_FAILURE",
            Self::RefreshRejected { .. } => "REFRESH_REJECTED",
            Self::EncryptionFailure(_) => "ENCRYPTION_FAILURE",
            Self::DecryptionFailure(_) => "DECRYPTION_FAILURE",
            Self::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::ProviderNotRegistered(_) => "PROVIDER_NOT_REGISTERED",
            Self::VersionConflict(_) => "VERSION_CONFLICT",
            Self::Store(_) => "STORE_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// The user has to start a new authorization to recover.
    pub fn restart_required(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound
                | Self::SessionExpired
                | Self::StateMismatch
                | Self::InvalidCode
                | Self::IncompleteTokenResponse(_)
                | Self::TokenExchangeFailed { .. }
        )
    }

    /// Retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SessionPersist(_)
                | Self::RefreshTransientFailure { .. }
                | Self::CircuitOpen { .. }
                | Self::VersionConflict(_)
                | Self::Store(_)
                | Self::Cancelled
        )
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

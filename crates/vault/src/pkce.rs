// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OAuth authorization code + PKCE (RFC 7636, S256) helpers.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::oauth::urlencoding;

/// Random bytes behind every verifier and state nonce (256 bits).
const ENTROPY_BYTES: usize = 32;

/// Generate a PKCE code verifier: 32 random bytes, hex-encoded (64 chars).
pub fn generate_code_verifier() -> String {
    random_hex()
}

/// Compute code_challenge = base64url_nopad(sha256(verifier)).
pub fn compute_code_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generate an anti-CSRF state nonce, independent from the verifier.
pub fn generate_state() -> String {
    random_hex()
}

fn random_hex() -> String {
    let mut bytes = [0u8; ENTROPY_BYTES];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Verifier, challenge, and state for one authorization attempt.
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
    pub state: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let verifier = generate_code_verifier();
        let challenge = compute_code_challenge(&verifier);
        Self { verifier, challenge, state: generate_state() }
    }
}

/// Provider-specific query parameters around the standard PKCE set.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExtraAuthParams {
    /// Emitted before `client_id`.
    #[serde(default)]
    pub leading: Vec<(String, String)>,
    /// Emitted after `state`.
    #[serde(default)]
    pub trailing: Vec<(String, String)>,
}

/// Build an authorization URL with PKCE parameters, in a fixed order.
pub fn build_auth_url(
    auth_url: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: &str,
    code_challenge: &str,
    state: &str,
    extra: &ExtraAuthParams,
) -> String {
    let mut params: Vec<(&str, &str)> =
        extra.leading.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    params.extend([
        ("client_id", client_id),
        ("response_type", "code"),
        ("redirect_uri", redirect_uri),
        ("scope", scope),
        ("code_challenge", code_challenge),
        ("code_challenge_method", "S256"),
        ("state", state),
    ]);
    params.extend(extra.trailing.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding(k), urlencoding(v)))
        .collect::<Vec<_>>()
        .join("&");
    let sep = if auth_url.contains('?') { '&' } else { '?' };
    format!("{auth_url}{sep}{query}")
}

#[cfg(test)]
#[path = "pkce_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OAuth helper types and utilities.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use url::{form_urlencoded, Url};

use crate::error::VaultError;

/// Lifetime assumed when a token response omits `expires_in`.
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Standard OAuth2 token response, plus whatever extra fields the provider sends.
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TokenResponse {
    pub fn into_token_set(self) -> OAuthTokenSet {
        let claims = self.id_token.as_deref().and_then(decode_jwt_claims);
        let organizations = extract_organizations(&self.extra, claims.as_ref());
        OAuthTokenSet {
            access_token: self.access_token,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
            id_token: self.id_token.filter(|t| !t.is_empty()),
            expires_in_secs: self.expires_in,
            scope: self.scope,
            organizations,
        }
    }
}

/// RFC 6749 §5.2 error body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenErrorResponse {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl TokenErrorResponse {
    pub fn is_invalid_grant(&self) -> bool {
        self.error == "invalid_grant"
    }

    pub fn message(&self) -> String {
        match &self.error_description {
            Some(desc) if !desc.is_empty() => format!("{}: {desc}", self.error),
            _ => self.error.clone(),
        }
    }
}

/// Tokens returned by a provider. Transient; encrypt before storing.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct OAuthTokenSet {
    pub access_token: String,
    /// Absent on refresh responses that do not rotate the refresh token.
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_in_secs: Option<u64>,
    pub scope: Option<String>,
    pub organizations: Vec<String>,
}

impl OAuthTokenSet {
    pub fn expires_in_secs_or_default(&self) -> u64 {
        self.expires_in_secs.unwrap_or(DEFAULT_EXPIRES_IN_SECS)
    }
}

impl fmt::Debug for OAuthTokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthTokenSet")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .field("expires_in_secs", &self.expires_in_secs)
            .field("scope", &self.scope)
            .field("organizations", &self.organizations)
            .finish_non_exhaustive()
    }
}

// -- Authorization code normalization ----------------------------------------

/// Code (and state, when the input carried one) recovered from user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedCode {
    pub code: String,
    pub state: Option<String>,
}

/// Recover an authorization code from whatever the user pasted.
///
/// First match wins: a callback URL (or bare query string) with a `code`
/// parameter, then `code#state`, then a bare code.
pub fn normalize_code(input: &str) -> Result<NormalizedCode, VaultError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(VaultError::InvalidCode);
    }

    if input.contains("://") {
        let url = Url::parse(input).map_err(|_| VaultError::InvalidCode)?;
        return code_from_query(url.query_pairs());
    }
    let query = match input.split_once('?') {
        Some((_, q)) => Some(q),
        None if input.starts_with("code=") => Some(input),
        None => None,
    };
    if let Some(query) = query {
        let query = query.split('#').next().unwrap_or_default();
        return code_from_query(form_urlencoded::parse(query.as_bytes()));
    }

    if let Some((code, state)) = input.split_once('#') {
        let code = code.trim();
        if code.is_empty() || code.contains(char::is_whitespace) {
            return Err(VaultError::InvalidCode);
        }
        let state = state.trim();
        return Ok(NormalizedCode {
            code: code.to_owned(),
            state: (!state.is_empty()).then(|| state.to_owned()),
        });
    }

    if input.contains(char::is_whitespace) {
        return Err(VaultError::InvalidCode);
    }
    Ok(NormalizedCode { code: input.to_owned(), state: None })
}

/// First `code` and `state` parameters of a decoded query.
fn code_from_query(pairs: form_urlencoded::Parse<'_>) -> Result<NormalizedCode, VaultError> {
    let mut code = None;
    let mut state = None;
    for (key, value) in pairs {
        match &*key {
            "code" if code.is_none() => code = Some(value.into_owned()),
            "state" if state.is_none() => state = Some(value.into_owned()),
            _ => {}
        }
    }
    let code = code.filter(|c| !c.is_empty()).ok_or(VaultError::InvalidCode)?;
    Ok(NormalizedCode { code, state: state.filter(|s| !s.is_empty()) })
}

// -- Identity token claims ---------------------------------------------------

/// Decode the payload of a JWT without verifying its signature.
pub fn decode_jwt_claims(token: &str) -> Option<serde_json::Value> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.is_object().then_some(claims)
}

const OPENAI_AUTH_CLAIM: &str = "https://api.openai.com/auth";

/// Organization ids from the token response body and id-token claims, in
/// first-seen order.
pub fn extract_organizations(
    body: &serde_json::Map<String, serde_json::Value>,
    claims: Option<&serde_json::Value>,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |id: &str| {
        if !id.is_empty() && !out.iter().any(|o| o == id) {
            out.push(id.to_owned());
        }
    };

    if let Some(org) = body.get("organization") {
        if let Some(id) = org_id(org) {
            push(id);
        }
    }
    for list in [
        body.get("organizations"),
        claims.and_then(|c| c.get("organizations")),
        claims.and_then(|c| c.get(OPENAI_AUTH_CLAIM)).and_then(|a| a.get("organizations")),
    ]
    .into_iter()
    .flatten()
    {
        for id in list.as_array().into_iter().flatten().filter_map(org_id) {
            push(id);
        }
    }
    out
}

fn org_id(value: &serde_json::Value) -> Option<&str> {
    match value {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Object(o) => {
            o.get("uuid").or_else(|| o.get("id")).and_then(|v| v.as_str())
        }
        _ => None,
    }
}

// -- Form encoding -----------------------------------------------------------

/// Form-style encoding (spaces as `+`).
pub fn urlencoding(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            b' ' => out.push('+'),
            _ => {
                out.push('%');
                out.push(char::from(HEX[(b >> 4) as usize]));
                out.push(char::from(HEX[(b & 0xf) as usize]));
            }
        }
    }
    out
}

const HEX: &[u8; 16] = b"0123456789ABCDEF";

#[cfg(test)]
#[path = "oauth_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Generic OAuth2 + PKCE provider driven by endpoint configuration.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::account::{epoch_ms, ProviderType, ProxyConfig};
use crate::oauth::{decode_jwt_claims, OAuthTokenSet, TokenResponse};
use crate::pkce::{self, ExtraAuthParams};
use crate::provider::{AuthUrlParams, CodeExchange, HttpClients, Provider, ProviderError};

/// Everything needed to talk to one OAuth authorization server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoints {
    pub authorize_url: String,
    pub token_url: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub extra_auth_params: ExtraAuthParams,
    /// Include `state` in the code exchange body.
    #[serde(default)]
    pub send_state_on_exchange: bool,
    /// Bearer-authenticated GET that succeeds while the access token is good.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_issuer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_audience: Option<String>,
}

pub struct OAuthProvider {
    kind: ProviderType,
    endpoints: ProviderEndpoints,
    http: Arc<HttpClients>,
}

impl OAuthProvider {
    pub fn new(kind: ProviderType, endpoints: ProviderEndpoints, http: Arc<HttpClients>) -> Self {
        Self { kind, endpoints, http }
    }

    pub fn endpoints(&self) -> &ProviderEndpoints {
        &self.endpoints
    }

    async fn post_token(
        &self,
        form: &[(&str, &str)],
        proxy: Option<&ProxyConfig>,
    ) -> Result<OAuthTokenSet, ProviderError> {
        let client = self.http.client(proxy)?;
        let resp = client
            .post(&self.endpoints.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("token request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderError::transient(format!("failed to read token response: {e}")))?;
        if !status.is_success() {
            return Err(ProviderError::from_response(status.as_u16(), &text));
        }

        let token: TokenResponse =
            serde_json::from_str(&text).map_err(|e| ProviderError::Malformed(format!("token response: {e}")))?;
        let set = token.into_token_set();
        if let Some(id_token) = set.id_token.as_deref() {
            if let Err(reason) = check_jwt(id_token, &self.endpoints, epoch_ms() / 1000) {
                // Advisory only: signatures are not verified here.
                tracing::warn!(provider = %self.kind, reason, "id_token failed advisory checks");
            }
        }
        Ok(set)
    }

    fn client_auth<'a>(&'a self, form: &mut Vec<(&'a str, &'a str)>) {
        form.push(("client_id", &self.endpoints.client_id));
        if let Some(secret) = self.endpoints.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }
    }
}

#[async_trait]
impl Provider for OAuthProvider {
    fn provider_type(&self) -> ProviderType {
        self.kind
    }

    fn default_redirect_uri(&self) -> &str {
        &self.endpoints.redirect_uri
    }

    fn default_scopes(&self) -> &[String] {
        &self.endpoints.scopes
    }

    fn build_auth_url(&self, params: &AuthUrlParams<'_>) -> String {
        pkce::build_auth_url(
            &self.endpoints.authorize_url,
            &self.endpoints.client_id,
            params.redirect_uri,
            &params.scopes.join(" "),
            params.code_challenge,
            params.state,
            &self.endpoints.extra_auth_params,
        )
    }

    async fn exchange_code(
        &self,
        exchange: &CodeExchange<'_>,
        proxy: Option<&ProxyConfig>,
    ) -> Result<OAuthTokenSet, ProviderError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", exchange.code),
            ("redirect_uri", exchange.redirect_uri),
            ("code_verifier", exchange.code_verifier),
        ];
        if self.endpoints.send_state_on_exchange {
            form.push(("state", exchange.state));
        }
        self.client_auth(&mut form);
        self.post_token(&form, proxy).await
    }

    async fn refresh_token(
        &self,
        refresh_token: &str,
        proxy: Option<&ProxyConfig>,
    ) -> Result<OAuthTokenSet, ProviderError> {
        let mut form = vec![("grant_type", "refresh_token"), ("refresh_token", refresh_token)];
        self.client_auth(&mut form);
        self.post_token(&form, proxy).await
    }

    async fn validate_token(&self, access_token: &str, proxy: Option<&ProxyConfig>) -> Result<(), ProviderError> {
        let Some(url) = self.endpoints.validate_url.as_deref() else {
            if decode_jwt_claims(access_token).is_none() {
                // Opaque token with no introspection endpoint: nothing to check.
                return Ok(());
            }
            // Local checks cannot prove revocation, so failures stay non-terminal.
            return check_jwt(access_token, &self.endpoints, epoch_ms() / 1000)
                .map_err(|message| ProviderError::Rejected { status: 401, message });
        };

        let client = self.http.client(proxy)?;
        let resp = client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("validation request failed: {e}")))?;
        let status = resp.status().as_u16();
        if resp.status().is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        match status {
            401 | 403 => Err(ProviderError::Unauthorized { status, message: body }),
            _ => Err(ProviderError::from_response(status, &body)),
        }
    }
}

/// Advisory structural checks on a JWT: `exp` in the future, and `iss`/`aud`
/// matching when configured. The signature is not verified.
pub fn check_jwt(token: &str, endpoints: &ProviderEndpoints, now_secs: u64) -> Result<(), String> {
    let claims = decode_jwt_claims(token).ok_or_else(|| "not a well-formed JWT".to_owned())?;

    if let Some(exp) = claims.get("exp").and_then(|v| v.as_u64()) {
        if exp <= now_secs {
            return Err(format!("token expired at {exp}"));
        }
    }
    if let Some(expected) = endpoints.expected_issuer.as_deref() {
        let iss = claims.get("iss").and_then(|v| v.as_str()).unwrap_or_default();
        if iss.trim_end_matches('/') != expected.trim_end_matches('/') {
            return Err(format!("unexpected issuer {iss:?}"));
        }
    }
    if let Some(expected) = endpoints.expected_audience.as_deref() {
        let matches = match claims.get("aud") {
            Some(serde_json::Value::String(aud)) => aud == expected,
            Some(serde_json::Value::Array(auds)) => auds.iter().any(|a| a.as_str() == Some(expected)),
            _ => false,
        };
        if !matches {
            return Err("audience mismatch".to_owned());
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "oauth_tests.rs"]
mod tests;

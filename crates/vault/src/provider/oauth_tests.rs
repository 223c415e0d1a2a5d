// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;

use super::*;
use crate::test_support::fake_jwt;

/// Token endpoint that replays `responses` in order (repeating the last) and
/// records every request body.
struct MockTokenServer {
    addr: SocketAddr,
    calls: Arc<AtomicU32>,
    bodies: Arc<Mutex<Vec<String>>>,
}

async fn mock_token_server(responses: Vec<(u16, String)>) -> MockTokenServer {
    let calls = Arc::new(AtomicU32::new(0));
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let responses = Arc::new(responses);

    let (calls_c, bodies_c) = (Arc::clone(&calls), Arc::clone(&bodies));
    let app = Router::new()
        .route(
            "/token",
            post(move |body: String| {
                let calls = Arc::clone(&calls_c);
                let bodies = Arc::clone(&bodies_c);
                let resps = Arc::clone(&responses);
                async move {
                    bodies.lock().push(body);
                    let idx = calls.fetch_add(1, Ordering::Relaxed) as usize;
                    let (status, body) = resps
                        .get(idx)
                        .or_else(|| resps.last())
                        .cloned()
                        .unwrap_or((500, "{}".to_owned()));
                    (
                        axum::http::StatusCode::from_u16(status)
                            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR),
                        body,
                    )
                }
            }),
        )
        .route(
            "/userinfo",
            get(|headers: axum::http::HeaderMap| async move {
                let auth = headers.get("authorization").and_then(|v| v.to_str().ok()).unwrap_or_default();
                match auth {
                    "Bearer good" => (axum::http::StatusCode::OK, "{}"),
                    "Bearer flaky" => (axum::http::StatusCode::SERVICE_UNAVAILABLE, "down"),
                    _ => (axum::http::StatusCode::UNAUTHORIZED, "invalid token"),
                }
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    MockTokenServer { addr, calls, bodies }
}

fn endpoints(addr: SocketAddr) -> ProviderEndpoints {
    ProviderEndpoints {
        authorize_url: format!("http://{addr}/authorize"),
        token_url: format!("http://{addr}/token"),
        client_id: "client-1".to_owned(),
        client_secret: None,
        redirect_uri: "http://localhost/cb".to_owned(),
        scopes: vec!["openid".to_owned(), "offline_access".to_owned()],
        extra_auth_params: ExtraAuthParams::default(),
        send_state_on_exchange: false,
        validate_url: None,
        expected_issuer: None,
        expected_audience: None,
    }
}

fn provider(endpoints: ProviderEndpoints) -> OAuthProvider {
    OAuthProvider::new(ProviderType::OpenAi, endpoints, Arc::new(HttpClients::default()))
}

fn success_body() -> String {
    json!({
        "access_token": "new-access",
        "refresh_token": "new-refresh",
        "expires_in": 3600,
        "scope": "openid offline_access",
    })
    .to_string()
}

#[tokio::test]
async fn exchange_code_posts_pkce_form() -> anyhow::Result<()> {
    let server = mock_token_server(vec![(200, success_body())]).await;
    let mut ep = endpoints(server.addr);
    ep.client_secret = Some("shh".to_owned());
    ep.send_state_on_exchange = true;
    let p = provider(ep);

    let exchange = CodeExchange {
        code: "ac_123",
        code_verifier: "verifier-abc",
        redirect_uri: "http://localhost/cb",
        state: "s1",
    };
    let set = p.exchange_code(&exchange, None).await?;
    assert_eq!(set.access_token, "new-access");
    assert_eq!(set.refresh_token.as_deref(), Some("new-refresh"));
    assert_eq!(set.expires_in_secs, Some(3600));

    let body = server.bodies.lock().first().cloned().unwrap_or_default();
    for part in [
        "grant_type=authorization_code",
        "code=ac_123",
        "code_verifier=verifier-abc",
        "redirect_uri=http%3A%2F%2Flocalhost%2Fcb",
        "client_id=client-1",
        "client_secret=shh",
        "state=s1",
    ] {
        assert!(body.contains(part), "missing {part} in {body}");
    }
    Ok(())
}

#[tokio::test]
async fn refresh_posts_refresh_grant() -> anyhow::Result<()> {
    let server = mock_token_server(vec![(200, success_body())]).await;
    let p = provider(endpoints(server.addr));
    p.refresh_token("old-refresh", None).await?;

    let body = server.bodies.lock().first().cloned().unwrap_or_default();
    assert!(body.contains("grant_type=refresh_token"));
    assert!(body.contains("refresh_token=old-refresh"));
    assert!(!body.contains("state="));
    assert_eq!(server.calls.load(Ordering::Relaxed), 1);
    Ok(())
}

#[tokio::test]
async fn refresh_invalid_grant_is_terminal() -> anyhow::Result<()> {
    let server = mock_token_server(vec![(
        400,
        json!({ "error": "invalid_grant", "error_description": "Refresh token revoked" }).to_string(),
    )])
    .await;
    let p = provider(endpoints(server.addr));
    let err = p.refresh_token("old", None).await.err();
    assert!(matches!(err, Some(ProviderError::InvalidGrant { status: 400, .. })));
    Ok(())
}

#[tokio::test]
async fn server_errors_are_transient() -> anyhow::Result<()> {
    let server = mock_token_server(vec![(502, "bad gateway".to_owned())]).await;
    let p = provider(endpoints(server.addr));
    let err = p.refresh_token("old", None).await.err();
    assert!(err.is_some_and(|e| e.is_retryable()));
    Ok(())
}

#[tokio::test]
async fn unparsable_success_is_malformed() -> anyhow::Result<()> {
    let server = mock_token_server(vec![(200, "<html>ok</html>".to_owned()), (200, "{}".to_owned())]).await;
    let p = provider(endpoints(server.addr));
    assert!(matches!(p.refresh_token("old", None).await, Err(ProviderError::Malformed(_))));
    // Parsable but empty sets are handed back for the caller to judge.
    let set = p.refresh_token("old", None).await?;
    assert!(set.access_token.is_empty());
    Ok(())
}

#[tokio::test]
async fn exchange_without_access_token_is_incomplete() -> anyhow::Result<()> {
    use crate::authorize::{Authorizer, BeginAuthorization};
    use crate::circuit::CircuitPolicy;
    use crate::error::VaultError;
    use crate::exchange::CompleteAuthorization;
    use crate::health::HealthMonitor;
    use crate::provider::ProviderRegistry;
    use crate::session::{MemorySessionStore, DEFAULT_SESSION_TTL};
    use crate::store::{AccountStore, MemoryAccountStore};

    let server =
        mock_token_server(vec![(200, json!({ "refresh_token": "r", "expires_in": 3600 }).to_string())]).await;
    let registry = Arc::new(ProviderRegistry::new());
    registry.register(Arc::new(provider(endpoints(server.addr))));
    let accounts = Arc::new(MemoryAccountStore::new());
    let cipher = crate::test_support::test_cipher()?;
    let (event_tx, _events) = tokio::sync::broadcast::channel(16);
    let health = Arc::new(HealthMonitor::new(
        Arc::clone(&accounts) as Arc<dyn AccountStore>,
        Arc::clone(&registry),
        Arc::clone(&cipher),
        CircuitPolicy::default(),
        event_tx.clone(),
    ));
    let authorizer = Authorizer::new(
        Arc::clone(&accounts) as Arc<dyn AccountStore>,
        Arc::new(MemorySessionStore::new()),
        cipher,
        registry,
        health,
        DEFAULT_SESSION_TTL,
        event_tx,
    );

    let url = authorizer.begin_authorization(BeginAuthorization::new(ProviderType::OpenAi)).await?;
    let result = authorizer
        .complete_authorization(CompleteAuthorization {
            session_id: url.session_id,
            code: "ac_123".to_owned(),
            name: "pool".to_owned(),
            description: String::new(),
            rpm_limit: None,
            tpm_limit: None,
            metadata: Default::default(),
        })
        .await;
    assert!(matches!(result, Err(VaultError::IncompleteTokenResponse(_))), "{result:?}");
    assert_eq!(server.calls.load(Ordering::Relaxed), 1);
    assert!(accounts.is_empty());
    Ok(())
}

#[tokio::test]
async fn connection_refused_is_transient() -> anyhow::Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);
    let p = provider(endpoints(addr));
    let err = p.refresh_token("old", None).await.err();
    assert!(matches!(err, Some(ProviderError::Transient { status: None, .. })));
    Ok(())
}

#[tokio::test]
async fn validate_via_endpoint() -> anyhow::Result<()> {
    let server = mock_token_server(vec![]).await;
    let mut ep = endpoints(server.addr);
    ep.validate_url = Some(format!("http://{}/userinfo", server.addr));
    let p = provider(ep);

    p.validate_token("good", None).await?;
    assert!(matches!(p.validate_token("bad", None).await, Err(ProviderError::Unauthorized { status: 401, .. })));
    assert!(p.validate_token("flaky", None).await.err().is_some_and(|e| e.is_retryable()));
    Ok(())
}

#[tokio::test]
async fn validate_without_endpoint_checks_jwt_claims() -> anyhow::Result<()> {
    let mut ep = endpoints("127.0.0.1:9".parse()?);
    ep.expected_issuer = Some("https://auth.example.com".to_owned());
    let p = provider(ep);

    p.validate_token("opaque-access-token", None).await?;

    let far = epoch_ms() / 1000 + 3600;
    let good = fake_jwt(&json!({ "iss": "https://auth.example.com/", "exp": far }));
    p.validate_token(&good, None).await?;

    let expired = fake_jwt(&json!({ "iss": "https://auth.example.com", "exp": 1 }));
    let err = p.validate_token(&expired, None).await.err();
    assert!(err.as_ref().is_some_and(|e| !e.is_terminal() && !e.is_retryable()));

    let wrong_iss = fake_jwt(&json!({ "iss": "https://evil.example.com", "exp": far }));
    assert!(p.validate_token(&wrong_iss, None).await.is_err());
    Ok(())
}

#[yare::parameterized(
    string_aud = { json!({ "aud": "client-1" }), true },
    array_aud = { json!({ "aud": ["other", "client-1"] }), true },
    wrong_aud = { json!({ "aud": "other" }), false },
    missing_aud = { json!({}), false },
)]
fn check_jwt_audience(claims: serde_json::Value, ok: bool) {
    let mut ep = endpoints("127.0.0.1:9".parse().unwrap());
    ep.expected_audience = Some("client-1".to_owned());
    assert_eq!(check_jwt(&fake_jwt(&claims), &ep, 0).is_ok(), ok);
}

#[test]
fn build_auth_url_uses_endpoints_and_params() {
    let p = provider(endpoints("127.0.0.1:9".parse().unwrap()));
    let scopes = vec!["openid".to_owned(), "offline_access".to_owned()];
    let url = p.build_auth_url(&AuthUrlParams {
        code_challenge: "ch",
        state: "st",
        redirect_uri: "http://localhost/cb",
        scopes: &scopes,
    });
    assert!(url.starts_with("http://127.0.0.1:9/authorize?client_id=client-1&response_type=code"));
    assert!(url.contains("scope=openid+offline_access"));
    assert!(url.contains("code_challenge=ch&code_challenge_method=S256&state=st"));
}

#[test]
fn proxied_clients_are_cached_per_url() -> anyhow::Result<()> {
    let http = HttpClients::default();
    let socks = ProxyConfig::new("socks5://h:1080");
    http.client(Some(&socks))?;
    http.client(Some(&socks))?;
    http.client(None)?;
    assert_eq!(http.cached(), 2);
    assert!(http.client(Some(&ProxyConfig::new("not a url"))).is_err());
    Ok(())
}

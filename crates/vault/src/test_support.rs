// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: builders, a scripted provider, and fixtures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::account::{epoch_ms, Account, AccountStatus, ProviderType, ProxyConfig, RateLimits, SealedToken};
use crate::authorize::Authorizer;
use crate::circuit::{CircuitPolicy, CircuitState};
use crate::crypto::{CryptoError, TokenCipher};
use crate::events::CredentialEvent;
use crate::health::HealthMonitor;
use crate::oauth::OAuthTokenSet;
use crate::pkce::PkcePair;
use crate::provider::{AuthUrlParams, CodeExchange, Provider, ProviderError, ProviderRegistry};
use crate::refresh::{BatchPolicy, RefreshEngine, RetryPolicy};
use crate::session::{MemorySessionStore, OAuthSession, SessionStore, DEFAULT_SESSION_TTL};
use crate::store::{AccountStore, MemoryAccountStore};

/// Fixed-key cipher for tests.
pub fn test_cipher() -> Result<Arc<TokenCipher>, CryptoError> {
    Ok(Arc::new(TokenCipher::new(&[42u8; 32])?))
}

/// Unsigned JWT carrying `claims`.
pub fn fake_jwt(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.sig")
}

pub fn token_set(access: &str, refresh: Option<&str>, expires_in: u64) -> OAuthTokenSet {
    OAuthTokenSet {
        access_token: access.to_owned(),
        refresh_token: refresh.map(str::to_owned),
        id_token: None,
        expires_in_secs: Some(expires_in),
        scope: None,
        organizations: vec![],
    }
}

pub fn session_fixture(state: &str) -> OAuthSession {
    let pair = PkcePair::generate();
    let now = epoch_ms();
    OAuthSession {
        provider: ProviderType::Claude,
        code_verifier: pair.verifier,
        code_challenge: pair.challenge,
        state: state.to_owned(),
        redirect_uri: "https://example.com/cb".to_owned(),
        scopes: vec!["user:inference".to_owned()],
        proxy: None,
        metadata: HashMap::new(),
        created_at_ms: now,
        expires_at_ms: now + 600_000,
    }
}

/// Builder for [`Account`] with serviceable defaults.
pub struct AccountBuilder {
    account: Account,
}

impl AccountBuilder {
    pub fn new(id: &str) -> Self {
        let now = epoch_ms();
        Self {
            account: Account {
                id: id.to_owned(),
                name: format!("account {id}"),
                description: String::new(),
                provider: ProviderType::Claude,
                status: AccountStatus::Active,
                health_score: 100,
                access_token: SealedToken::from_ciphertext("v1:test-access".to_owned()),
                refresh_token: SealedToken::from_ciphertext("v1:test-refresh".to_owned()),
                id_token: None,
                token_expires_at_ms: Some(now + 3_600_000),
                organizations: vec![],
                proxy: None,
                rate_limits: RateLimits::default(),
                circuit: CircuitState::default(),
                metadata: HashMap::new(),
                created_at_ms: now,
                updated_at_ms: now,
                last_refresh_attempt_at_ms: None,
                last_error: None,
                version: 0,
            },
        }
    }

    pub fn provider(mut self, provider: ProviderType) -> Self {
        self.account.provider = provider;
        self
    }

    pub fn status(mut self, status: AccountStatus) -> Self {
        self.account.status = status;
        self
    }

    pub fn health(mut self, score: u8) -> Self {
        self.account.health_score = score;
        self
    }

    pub fn expires_at_ms(mut self, at: u64) -> Self {
        self.account.token_expires_at_ms = Some(at);
        self
    }

    pub fn no_expiry(mut self) -> Self {
        self.account.token_expires_at_ms = None;
        self
    }

    pub fn proxy(mut self, url: &str) -> Self {
        self.account.proxy = Some(ProxyConfig::new(url));
        self
    }

    pub fn circuit(mut self, circuit: CircuitState) -> Self {
        self.account.circuit = circuit;
        self
    }

    /// Encrypt real token material with `cipher`.
    pub fn tokens(mut self, cipher: &TokenCipher, access: &str, refresh: &str) -> Result<Self, CryptoError> {
        self.account.access_token = SealedToken::from_ciphertext(cipher.encrypt_str(access)?);
        self.account.refresh_token = SealedToken::from_ciphertext(cipher.encrypt_str(refresh)?);
        Ok(self)
    }

    pub fn build(self) -> Account {
        self.account
    }
}

type Scripted<T> = Mutex<VecDeque<Result<T, ProviderError>>>;

/// What a [`MockProvider`] saw on a code exchange.
#[derive(Debug, Clone)]
pub struct RecordedExchange {
    pub code: String,
    pub code_verifier: String,
    pub redirect_uri: String,
    pub state: String,
    pub proxy: Option<ProxyConfig>,
}

/// What a [`MockProvider`] saw on a refresh.
#[derive(Debug, Clone)]
pub struct RecordedRefresh {
    pub refresh_token: String,
    pub at: Instant,
    pub proxy: Option<ProxyConfig>,
}

/// Scripted in-memory provider.
///
/// Queued results are consumed in order. Once a queue is empty, exchanges and
/// refreshes succeed with generated tokens, unless the refresh token was
/// registered with [`MockProvider::fail_refresh_token`].
pub struct MockProvider {
    kind: ProviderType,
    redirect_uri: String,
    scopes: Vec<String>,
    exchanges: Scripted<OAuthTokenSet>,
    refreshes: Scripted<OAuthTokenSet>,
    validation: Mutex<Result<(), ProviderError>>,
    failing_tokens: Mutex<HashMap<String, ProviderError>>,
    refresh_delay: Mutex<Option<Duration>>,
    exchange_log: Mutex<Vec<RecordedExchange>>,
    refresh_log: Mutex<Vec<RecordedRefresh>>,
    validations: AtomicU32,
    minted: AtomicU32,
    in_flight: AtomicU32,
    peak_in_flight: AtomicU32,
}

impl MockProvider {
    pub fn new(kind: ProviderType) -> Self {
        Self {
            kind,
            redirect_uri: "https://example.com/cb".to_owned(),
            scopes: vec!["user:inference".to_owned()],
            exchanges: Mutex::new(VecDeque::new()),
            refreshes: Mutex::new(VecDeque::new()),
            validation: Mutex::new(Ok(())),
            failing_tokens: Mutex::new(HashMap::new()),
            refresh_delay: Mutex::new(None),
            exchange_log: Mutex::new(Vec::new()),
            refresh_log: Mutex::new(Vec::new()),
            validations: AtomicU32::new(0),
            minted: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            peak_in_flight: AtomicU32::new(0),
        }
    }

    pub fn with_redirect_uri(mut self, uri: &str) -> Self {
        self.redirect_uri = uri.to_owned();
        self
    }

    pub fn push_exchange(&self, result: Result<OAuthTokenSet, ProviderError>) {
        self.exchanges.lock().push_back(result);
    }

    pub fn push_refresh(&self, result: Result<OAuthTokenSet, ProviderError>) {
        self.refreshes.lock().push_back(result);
    }

    pub fn set_validation(&self, result: Result<(), ProviderError>) {
        *self.validation.lock() = result;
    }

    pub fn fail_refresh_token(&self, refresh_token: &str, err: ProviderError) {
        self.failing_tokens.lock().insert(refresh_token.to_owned(), err);
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock() = Some(delay);
    }

    pub fn exchanges(&self) -> Vec<RecordedExchange> {
        self.exchange_log.lock().clone()
    }

    pub fn refreshes(&self) -> Vec<RecordedRefresh> {
        self.refresh_log.lock().clone()
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_log.lock().len()
    }

    /// Most refresh calls that were running at the same time.
    pub fn peak_in_flight(&self) -> u32 {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn validation_count(&self) -> u32 {
        self.validations.load(Ordering::SeqCst)
    }

    fn mint(&self) -> OAuthTokenSet {
        let n = self.minted.fetch_add(1, Ordering::SeqCst) + 1;
        token_set(&format!("access-{n}"), Some(&format!("refresh-{n}")), 3600)
    }
}

/// Counts a running call until dropped, so cancelled calls are released too.
struct InFlight<'a>(&'a AtomicU32);

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicU32, peak: &AtomicU32) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(current)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn provider_type(&self) -> ProviderType {
        self.kind
    }

    fn default_redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    fn default_scopes(&self) -> &[String] {
        &self.scopes
    }

    fn build_auth_url(&self, params: &AuthUrlParams<'_>) -> String {
        crate::pkce::build_auth_url(
            "https://auth.example.com/authorize",
            "mock-client",
            params.redirect_uri,
            &params.scopes.join(" "),
            params.code_challenge,
            params.state,
            &Default::default(),
        )
    }

    async fn exchange_code(
        &self,
        exchange: &CodeExchange<'_>,
        proxy: Option<&ProxyConfig>,
    ) -> Result<OAuthTokenSet, ProviderError> {
        self.exchange_log.lock().push(RecordedExchange {
            code: exchange.code.to_owned(),
            code_verifier: exchange.code_verifier.to_owned(),
            redirect_uri: exchange.redirect_uri.to_owned(),
            state: exchange.state.to_owned(),
            proxy: proxy.cloned(),
        });
        let scripted = self.exchanges.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(self.mint()))
    }

    async fn refresh_token(
        &self,
        refresh_token: &str,
        proxy: Option<&ProxyConfig>,
    ) -> Result<OAuthTokenSet, ProviderError> {
        self.refresh_log.lock().push(RecordedRefresh {
            refresh_token: refresh_token.to_owned(),
            at: Instant::now(),
            proxy: proxy.cloned(),
        });
        let _in_flight = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        let delay = *self.refresh_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self.failing_tokens.lock().get(refresh_token).cloned();
        if let Some(err) = failing {
            return Err(err);
        }
        let scripted = self.refreshes.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(self.mint()))
    }

    async fn validate_token(&self, _access_token: &str, _proxy: Option<&ProxyConfig>) -> Result<(), ProviderError> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        self.validation.lock().clone()
    }
}

/// Fully wired components over in-memory stores and one [`MockProvider`].
pub struct Harness {
    pub accounts: Arc<MemoryAccountStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub provider: Arc<MockProvider>,
    pub cipher: Arc<TokenCipher>,
    pub health: Arc<HealthMonitor>,
    pub authorizer: Authorizer,
    pub refresh: Arc<RefreshEngine>,
    pub events: broadcast::Receiver<CredentialEvent>,
}

impl Harness {
    pub fn new(provider: MockProvider) -> Result<Self, CryptoError> {
        Self::with_sessions(provider, Arc::new(MemorySessionStore::new()))
    }

    pub fn with_sessions(provider: MockProvider, sessions: Arc<dyn SessionStore>) -> Result<Self, CryptoError> {
        let accounts = Arc::new(MemoryAccountStore::new());
        let provider = Arc::new(provider);
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(Arc::clone(&provider) as Arc<dyn Provider>);
        let cipher = test_cipher()?;
        let (event_tx, events) = broadcast::channel(64);
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&accounts) as Arc<dyn AccountStore>,
            Arc::clone(&registry),
            Arc::clone(&cipher),
            CircuitPolicy::default(),
            event_tx.clone(),
        ));
        let authorizer = Authorizer::new(
            Arc::clone(&accounts) as Arc<dyn AccountStore>,
            Arc::clone(&sessions),
            Arc::clone(&cipher),
            Arc::clone(&registry),
            Arc::clone(&health),
            DEFAULT_SESSION_TTL,
            event_tx.clone(),
        );
        let refresh = Arc::new(RefreshEngine::new(
            Arc::clone(&accounts) as Arc<dyn AccountStore>,
            registry,
            Arc::clone(&cipher),
            Arc::clone(&health),
            RetryPolicy::default(),
            BatchPolicy::default(),
            event_tx,
        ));
        Ok(Self { accounts, sessions, provider, cipher, health, authorizer, refresh, events })
    }

    /// Drain the events emitted so far.
    pub fn drain_events(&mut self) -> Vec<CredentialEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }
}

/// Assert that an expression is `Err` and its message contains a substring.
#[macro_export]
macro_rules! assert_err_contains {
    ($expr:expr, $substr:expr) => {{
        let result = $expr;
        let err = result.expect_err(concat!("expected Err for: ", stringify!($expr)));
        let msg = err.to_string();
        assert!(msg.contains($substr), "expected error containing {:?}, got: {msg:?}", $substr);
    }};
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::circuit::{CircuitPolicy, CircuitState};
use crate::provider::Provider;
use crate::store::MemoryAccountStore;
use crate::test_support::{test_cipher, token_set, AccountBuilder, MockProvider};

struct Fixture {
    store: Arc<MemoryAccountStore>,
    provider: Arc<MockProvider>,
    cipher: Arc<TokenCipher>,
    engine: Arc<RefreshEngine>,
    events: broadcast::Receiver<CredentialEvent>,
}

fn fixture_with(retry: RetryPolicy, batch: BatchPolicy) -> anyhow::Result<Fixture> {
    let store = Arc::new(MemoryAccountStore::new());
    let provider = Arc::new(MockProvider::new(ProviderType::Claude));
    let registry = Arc::new(ProviderRegistry::new());
    registry.register(Arc::clone(&provider) as Arc<dyn Provider>);
    let cipher = test_cipher()?;
    let (tx, events) = broadcast::channel(64);
    let health = Arc::new(HealthMonitor::new(
        Arc::clone(&store) as Arc<dyn AccountStore>,
        Arc::clone(&registry),
        Arc::clone(&cipher),
        CircuitPolicy::default(),
        tx.clone(),
    ));
    let engine = Arc::new(RefreshEngine::new(
        Arc::clone(&store) as Arc<dyn AccountStore>,
        registry,
        Arc::clone(&cipher),
        health,
        retry,
        batch,
        tx,
    ));
    Ok(Fixture { store, provider, cipher, engine, events })
}

fn fixture() -> anyhow::Result<Fixture> {
    fixture_with(RetryPolicy::default(), BatchPolicy::default())
}

async fn seed(f: &Fixture, builder: AccountBuilder, refresh_token: &str) -> anyhow::Result<Account> {
    let account = builder.tokens(&f.cipher, "old-access", refresh_token)?.build();
    Ok(f.store.create(account).await?)
}

async fn stored(f: &Fixture, id: &str) -> anyhow::Result<Account> {
    f.store.get(id).await?.ok_or_else(|| anyhow::anyhow!("account {id} missing"))
}

#[yare::parameterized(
    first = { 1, 1 },
    second = { 2, 2 },
    third = { 3, 4 },
    capped = { 4, 4 },
    far = { 40, 4 },
)]
fn backoff_doubles_up_to_cap(retry: u32, secs: u64) {
    assert_eq!(RetryPolicy::default().backoff_for(retry), Duration::from_secs(secs));
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_with_backoff() -> anyhow::Result<()> {
    let f = fixture()?;
    seed(&f, AccountBuilder::new("a1"), "rt").await?;
    f.provider.push_refresh(Err(ProviderError::transient("connection reset")));
    f.provider.push_refresh(Err(ProviderError::Transient { status: Some(503), message: "unavailable".into() }));
    f.provider.push_refresh(Ok(token_set("fresh", Some("rt2"), 3600)));

    let account = f.engine.refresh_one("a1").await?;

    let calls = f.provider.refreshes();
    assert_eq!(calls.len(), 3);
    assert!(calls[1].at - calls[0].at >= Duration::from_secs(1));
    assert!(calls[2].at - calls[1].at >= Duration::from_secs(2));
    assert_eq!(f.cipher.decrypt_str(account.access_token.ciphertext())?, "fresh");
    assert_eq!(f.cipher.decrypt_str(account.refresh_token.ciphertext())?, "rt2");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_report_non_terminal_failure() -> anyhow::Result<()> {
    let mut f = fixture()?;
    seed(&f, AccountBuilder::new("a1"), "rt").await?;
    for _ in 0..3 {
        f.provider.push_refresh(Err(ProviderError::transient("timeout")));
    }

    let err = f.engine.refresh_one("a1").await.err();
    assert!(matches!(err, Some(VaultError::RefreshTransientFailure { attempts: 3, .. })));
    assert_eq!(f.provider.refresh_count(), 3);

    let account = stored(&f, "a1").await?;
    assert_eq!(account.health_score, 80);
    assert_eq!(account.status, AccountStatus::Active);
    assert!(!account.circuit.is_broken);
    assert!(matches!(f.events.try_recv()?, CredentialEvent::RefreshFailed { terminal: false, .. }));
    Ok(())
}

#[tokio::test]
async fn invalid_grant_is_called_once_and_breaks_circuit() -> anyhow::Result<()> {
    let mut f = fixture()?;
    seed(&f, AccountBuilder::new("a1"), "rt").await?;
    f.provider.push_refresh(Err(ProviderError::InvalidGrant { status: 400, message: "revoked".into() }));

    let err = f.engine.refresh_one("a1").await.err();
    assert!(matches!(err, Some(VaultError::RefreshTokenInvalid(_))));
    assert_eq!(f.provider.refresh_count(), 1);

    let account = stored(&f, "a1").await?;
    assert!(account.circuit.is_broken);
    assert_eq!(account.status, AccountStatus::Error);
    assert!(!account.is_serveable());

    let mut saw_failed = false;
    let mut saw_broken = false;
    while let Ok(event) = f.events.try_recv() {
        match event {
            CredentialEvent::RefreshFailed { terminal: true, .. } => saw_failed = true,
            CredentialEvent::CircuitBroken { .. } => saw_broken = true,
            _ => {}
        }
    }
    assert!(saw_failed && saw_broken);
    Ok(())
}

#[tokio::test]
async fn non_grant_rejections_are_not_retried() -> anyhow::Result<()> {
    let cases = [
        ProviderError::Rejected { status: 400, message: "invalid_client".into() },
        ProviderError::Unauthorized { status: 401, message: "nope".into() },
        ProviderError::Malformed("not json".into()),
    ];
    for err in cases {
        let f = fixture()?;
        seed(&f, AccountBuilder::new("a1"), "rt").await?;
        f.provider.push_refresh(Err(err.clone()));

        let result = f.engine.refresh_one("a1").await;
        assert!(matches!(result, Err(VaultError::RefreshRejected { .. })), "{err:?}: {result:?}");
        assert_eq!(f.provider.refresh_count(), 1, "{err:?}");

        let account = stored(&f, "a1").await?;
        assert_eq!(account.health_score, 80, "{err:?}");
        assert!(!account.circuit.is_broken, "{err:?}");
    }
    Ok(())
}

#[tokio::test]
async fn missing_refresh_token_keeps_previous() -> anyhow::Result<()> {
    let mut f = fixture()?;
    seed(&f, AccountBuilder::new("a1").health(50), "rt-original").await?;
    f.provider.push_refresh(Ok(token_set("fresh", None, 7200)));

    let before = epoch_ms();
    let account = f.engine.refresh_one("a1").await?;

    assert_eq!(f.cipher.decrypt_str(account.refresh_token.ciphertext())?, "rt-original");
    assert_eq!(f.cipher.decrypt_str(account.access_token.ciphertext())?, "fresh");
    let expires = account.token_expires_at_ms.unwrap_or_default();
    assert!(expires >= before + 7_200_000);
    assert!(account.last_refresh_attempt_at_ms.is_some_and(|at| at >= before));
    assert_eq!(account.health_score, 60);
    assert!(matches!(f.events.try_recv()?, CredentialEvent::Refreshed { expires_at_ms, .. } if expires_at_ms == expires));
    Ok(())
}

#[tokio::test]
async fn refresh_stores_organizations_and_id_token() -> anyhow::Result<()> {
    let f = fixture()?;
    seed(&f, AccountBuilder::new("a1"), "rt").await?;
    let mut tokens = token_set("fresh", Some("rt2"), 3600);
    tokens.id_token = Some("id-token".into());
    tokens.organizations = vec!["org-1".into()];
    f.provider.push_refresh(Ok(tokens));

    let account = f.engine.refresh_one("a1").await?;
    assert_eq!(account.organizations, vec!["org-1".to_owned()]);
    let id_token = account.id_token.ok_or_else(|| anyhow::anyhow!("id token missing"))?;
    assert_eq!(f.cipher.decrypt_str(id_token.ciphertext())?, "id-token");
    Ok(())
}

#[tokio::test]
async fn expired_response_is_rejected() -> anyhow::Result<()> {
    let f = fixture()?;
    seed(&f, AccountBuilder::new("a1"), "rt").await?;
    f.provider.push_refresh(Ok(token_set("fresh", Some("rt2"), 0)));

    let result = f.engine.refresh_one("a1").await;
    assert!(matches!(result, Err(VaultError::RefreshRejected { status: None, .. })));
    let account = stored(&f, "a1").await?;
    assert_eq!(f.cipher.decrypt_str(account.refresh_token.ciphertext())?, "rt");
    Ok(())
}

#[tokio::test]
async fn undecryptable_refresh_token_is_reported() -> anyhow::Result<()> {
    let mut f = fixture()?;
    f.store.create(AccountBuilder::new("a1").build()).await?;

    let result = f.engine.refresh_one("a1").await;
    assert!(matches!(result, Err(VaultError::DecryptionFailure(_))));
    assert_eq!(f.provider.refresh_count(), 0);
    let account = stored(&f, "a1").await?;
    assert_eq!(account.health_score, 80);
    assert!(account.last_error.is_some());
    assert!(matches!(
        f.events.try_recv()?,
        CredentialEvent::RefreshFailed { terminal: false, ref account_id, .. } if account_id == "a1"
    ));
    Ok(())
}

#[tokio::test]
async fn unknown_account_and_unregistered_provider() -> anyhow::Result<()> {
    let f = fixture()?;
    seed(&f, AccountBuilder::new("g1").provider(ProviderType::Gemini), "rt").await?;

    assert!(matches!(f.engine.refresh_one("ghost").await, Err(VaultError::AccountNotFound(_))));
    assert!(matches!(
        f.engine.refresh_one("g1").await,
        Err(VaultError::ProviderNotRegistered(ProviderType::Gemini))
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_in_flight_call() -> anyhow::Result<()> {
    let mut f = fixture()?;
    seed(&f, AccountBuilder::new("a1"), "rt").await?;
    f.provider.set_refresh_delay(Duration::from_secs(20));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let result = f.engine.refresh_one_with("a1", &cancel).await;
    assert!(matches!(result, Err(VaultError::Cancelled)));
    assert_eq!(stored(&f, "a1").await?.health_score, 100);
    assert!(f.events.try_recv().is_err());
    assert!(f.engine.leases.lock().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_backoff_sleep() -> anyhow::Result<()> {
    let retry = RetryPolicy {
        initial_backoff: Duration::from_secs(30),
        max_backoff: Duration::from_secs(30),
        ..Default::default()
    };
    let f = fixture_with(retry, BatchPolicy::default())?;
    seed(&f, AccountBuilder::new("a1"), "rt").await?;
    f.provider.push_refresh(Err(ProviderError::transient("reset")));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let start = tokio::time::Instant::now();
    let result = f.engine.refresh_one_with("a1", &cancel).await;
    assert!(matches!(result, Err(VaultError::Cancelled)));
    assert!(start.elapsed() < Duration::from_secs(30));
    assert_eq!(f.provider.refresh_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn call_timeout_is_transient() -> anyhow::Result<()> {
    let retry = RetryPolicy { max_attempts: 2, call_timeout: Duration::from_secs(5), ..Default::default() };
    let f = fixture_with(retry, BatchPolicy::default())?;
    seed(&f, AccountBuilder::new("a1"), "rt").await?;
    f.provider.set_refresh_delay(Duration::from_secs(10));

    let result = f.engine.refresh_one("a1").await;
    assert!(matches!(result, Err(VaultError::RefreshTransientFailure { attempts: 2, .. })));
    assert_eq!(f.provider.refresh_count(), 2);
    Ok(())
}

#[tokio::test]
async fn broken_account_is_rejected_before_backoff() -> anyhow::Result<()> {
    let f = fixture()?;
    let circuit = CircuitState {
        is_broken: true,
        broken_at_ms: Some(epoch_ms()),
        backoff_retry_at_ms: Some(epoch_ms() + 60_000),
        broken_count: 1,
        ..Default::default()
    };
    seed(&f, AccountBuilder::new("a1").status(AccountStatus::Error).circuit(circuit), "rt").await?;

    let result = f.engine.refresh_one("a1").await;
    assert!(matches!(result, Err(VaultError::CircuitOpen { retry_at_ms: Some(_), .. })));
    assert_eq!(f.provider.refresh_count(), 0);
    Ok(())
}

#[tokio::test]
async fn due_broken_account_recovers_through_probe() -> anyhow::Result<()> {
    let mut f = fixture()?;
    let circuit = CircuitState {
        is_broken: true,
        broken_at_ms: Some(epoch_ms() - 120_000),
        backoff_retry_at_ms: Some(epoch_ms() - 60_000),
        broken_count: 1,
        consecutive_failures: 3,
        ..Default::default()
    };
    seed(&f, AccountBuilder::new("a1").status(AccountStatus::Error).health(40).circuit(circuit), "rt").await?;

    let account = f.engine.refresh_one("a1").await?;
    assert!(!account.circuit.is_broken);
    assert_eq!(account.status, AccountStatus::Active);
    assert_eq!(account.health_score, 100);

    let recovered = std::iter::from_fn(|| f.events.try_recv().ok())
        .any(|e| matches!(e, CredentialEvent::CircuitRecovered { probe_count: 1, .. }));
    assert!(recovered);
    Ok(())
}

#[tokio::test]
async fn disabled_account_is_never_refreshed() -> anyhow::Result<()> {
    let f = fixture()?;
    seed(&f, AccountBuilder::new("a1").status(AccountStatus::Disabled), "rt").await?;
    let result = f.engine.refresh_one("a1").await;
    assert!(matches!(result, Err(VaultError::CircuitOpen { retry_at_ms: None, .. })));
    assert_eq!(f.provider.refresh_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn concurrent_refreshes_use_rotated_token() -> anyhow::Result<()> {
    let f = fixture()?;
    seed(&f, AccountBuilder::new("a1"), "rt-0").await?;
    f.provider.set_refresh_delay(Duration::from_millis(100));

    let (first, second) = tokio::join!(f.engine.refresh_one("a1"), f.engine.refresh_one("a1"));
    first?;
    second?;

    let calls = f.provider.refreshes();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].refresh_token, "rt-0");
    assert_eq!(calls[1].refresh_token, "refresh-1");
    assert!(calls[1].at - calls[0].at >= Duration::from_millis(100));
    assert!(f.engine.leases.lock().is_empty());
    Ok(())
}

#[tokio::test]
async fn refresh_uses_account_proxy() -> anyhow::Result<()> {
    let f = fixture()?;
    seed(&f, AccountBuilder::new("a1").proxy("socks5://h:1080"), "rt").await?;
    f.engine.refresh_one("a1").await?;
    let calls = f.provider.refreshes();
    assert_eq!(calls[0].proxy.as_ref().map(|p| p.url.as_str()), Some("socks5://h:1080"));
    Ok(())
}

#[tokio::test]
async fn batch_counts_failures_without_aborting() -> anyhow::Result<()> {
    let f = fixture()?;
    let soon = epoch_ms() + 60_000;
    for i in 0..10 {
        seed(&f, AccountBuilder::new(&format!("a{i}")).expires_at_ms(soon), &format!("rt-{i}")).await?;
    }
    for i in [2, 5, 8] {
        f.provider.fail_refresh_token(
            &format!("rt-{i}"),
            ProviderError::InvalidGrant { status: 400, message: "revoked".into() },
        );
    }
    // Not expiring, API-key, and disabled accounts are skipped.
    seed(&f, AccountBuilder::new("later").expires_at_ms(epoch_ms() + 86_400_000), "rt-later").await?;
    seed(&f, AccountBuilder::new("key").provider(ProviderType::AnthropicApiKey).expires_at_ms(soon), "k").await?;
    seed(&f, AccountBuilder::new("off").status(AccountStatus::Disabled).expires_at_ms(soon), "rt-off").await?;

    let summary = f.engine.refresh_expiring(Duration::from_secs(300)).await?;
    assert_eq!(summary, RefreshSummary { total: 10, succeeded: 7, failed: 3 });

    for i in 0..10 {
        let account = stored(&f, &format!("a{i}")).await?;
        assert!(account.last_refresh_attempt_at_ms.is_some(), "a{i} missing attempt marker");
    }
    assert!(stored(&f, "later").await?.last_refresh_attempt_at_ms.is_none());
    assert!(stored(&f, "a5").await?.circuit.is_broken);
    Ok(())
}

#[tokio::test]
async fn batch_respects_provider_filter() -> anyhow::Result<()> {
    let f = fixture()?;
    let soon = epoch_ms() + 60_000;
    seed(&f, AccountBuilder::new("c1").expires_at_ms(soon), "rt-c").await?;
    seed(&f, AccountBuilder::new("o1").provider(ProviderType::OpenAi).expires_at_ms(soon), "rt-o").await?;

    let summary = f.engine.refresh_expiring_for(Duration::from_secs(300), &[ProviderType::Claude]).await?;
    assert_eq!(summary, RefreshSummary { total: 1, succeeded: 1, failed: 0 });

    let empty = f.engine.refresh_expiring_for(Duration::from_secs(300), &[ProviderType::AnthropicApiKey]).await?;
    assert_eq!(empty, RefreshSummary::default());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn batch_timeout_skips_unstarted_and_finishes_running() -> anyhow::Result<()> {
    let batch = BatchPolicy { concurrency: 1, job_timeout: Duration::from_secs(15) };
    let f = fixture_with(RetryPolicy::default(), batch)?;
    let soon = epoch_ms() + 60_000;
    for i in 0..3 {
        seed(&f, AccountBuilder::new(&format!("a{i}")).expires_at_ms(soon), &format!("rt-{i}")).await?;
    }
    f.provider.set_refresh_delay(Duration::from_secs(10));

    let summary = f.engine.refresh_expiring(Duration::from_secs(300)).await?;
    assert_eq!(summary, RefreshSummary { total: 3, succeeded: 2, failed: 1 });
    assert_eq!(f.provider.refresh_count(), 2);

    let mut rotated = 0;
    let mut untouched = 0;
    for i in 0..3 {
        let account = stored(&f, &format!("a{i}")).await?;
        let refresh = f.cipher.decrypt_str(account.refresh_token.ciphertext())?;
        if account.last_refresh_attempt_at_ms.is_some() {
            assert!(refresh.starts_with("refresh-"), "a{i} lost its rotated token");
            rotated += 1;
        } else {
            assert_eq!(refresh, format!("rt-{i}"));
            untouched += 1;
        }
    }
    assert_eq!((rotated, untouched), (2, 1));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn batch_runs_a_bounded_pool() -> anyhow::Result<()> {
    let f = fixture()?;
    let soon = epoch_ms() + 60_000;
    for i in 0..12 {
        seed(&f, AccountBuilder::new(&format!("a{i}")).expires_at_ms(soon), &format!("rt-{i}")).await?;
    }
    f.provider.set_refresh_delay(Duration::from_secs(1));

    let summary = f.engine.refresh_expiring(Duration::from_secs(300)).await?;
    assert_eq!(summary, RefreshSummary { total: 12, succeeded: 12, failed: 0 });
    let peak = f.provider.peak_in_flight();
    assert!(peak > 1, "batch ran serially");
    assert!(peak as usize <= BatchPolicy::default().concurrency, "peak {peak} exceeds pool size");
    Ok(())
}

#[tokio::test]
async fn probe_broken_runs_one_trial_per_due_account() -> anyhow::Result<()> {
    let f = fixture()?;
    let due = CircuitState {
        is_broken: true,
        broken_at_ms: Some(epoch_ms() - 120_000),
        backoff_retry_at_ms: Some(epoch_ms() - 1),
        broken_count: 1,
        ..Default::default()
    };
    let waiting = CircuitState { backoff_retry_at_ms: Some(epoch_ms() + 600_000), ..due.clone() };
    seed(&f, AccountBuilder::new("due").status(AccountStatus::Error).circuit(due), "rt-due").await?;
    seed(&f, AccountBuilder::new("wait").status(AccountStatus::Error).circuit(waiting), "rt-wait").await?;

    let summary = f.engine.probe_broken().await?;
    assert_eq!(summary, RefreshSummary { total: 1, succeeded: 1, failed: 0 });
    assert_eq!(stored(&f, "due").await?.status, AccountStatus::Active);
    assert!(stored(&f, "wait").await?.circuit.is_broken);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn schedules_sweep_and_stop_on_shutdown() -> anyhow::Result<()> {
    let f = fixture()?;
    seed(&f, AccountBuilder::new("a1").expires_at_ms(epoch_ms() + 60_000), "rt").await?;

    let shutdown = CancellationToken::new();
    let handles = f.engine.spawn_schedules(ScheduleConfig::default(), shutdown.clone());
    assert_eq!(handles.len(), 3);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(f.provider.refresh_count(), 1);

    shutdown.cancel();
    for handle in handles {
        handle.await?;
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn shutdown_lets_running_refresh_persist() -> anyhow::Result<()> {
    let f = fixture()?;
    seed(&f, AccountBuilder::new("a1").expires_at_ms(epoch_ms() + 60_000), "rt").await?;
    f.provider.set_refresh_delay(Duration::from_secs(5));

    let shutdown = CancellationToken::new();
    let handles = f.engine.spawn_schedules(ScheduleConfig::default(), shutdown.clone());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(f.provider.refresh_count(), 1);

    shutdown.cancel();
    for handle in handles {
        handle.await?;
    }
    let account = stored(&f, "a1").await?;
    assert!(f.cipher.decrypt_str(account.refresh_token.ciphertext())?.starts_with("refresh-"));
    assert_eq!(f.provider.refresh_count(), 1);
    Ok(())
}

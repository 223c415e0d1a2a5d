// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared HTTP clients, one per outbound proxy.

use std::collections::HashMap;
use std::sync::Once;
use std::time::Duration;

use parking_lot::Mutex;

use crate::account::ProxyConfig;
use crate::provider::ProviderError;

/// Default timeout for a single upstream call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls. Only the first call
/// has an effect; a provider installed by the host process wins.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Caches a `reqwest::Client` per proxy URL so connection pools are reused.
pub struct HttpClients {
    timeout: Duration,
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl Default for HttpClients {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl HttpClients {
    pub fn new(timeout: Duration) -> Self {
        ensure_crypto();
        Self { timeout, clients: Mutex::new(HashMap::new()) }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Client routed through `proxy`, or a direct client.
    pub fn client(&self, proxy: Option<&ProxyConfig>) -> Result<reqwest::Client, ProviderError> {
        let key = proxy.map(|p| p.url.clone());
        if let Some(client) = self.clients.lock().get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy.url.as_str())
                .map_err(|e| ProviderError::Rejected { status: 0, message: format!("invalid proxy: {e}") })?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| ProviderError::transient(format!("failed to build http client: {e}")))?;

        self.clients.lock().entry(key).or_insert(client.clone());
        Ok(client)
    }

    pub fn cached(&self) -> usize {
        self.clients.lock().len()
    }
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! AES-256-GCM encryption for tokens at rest.
//!
//! Ciphertexts are `v1:` followed by base64(nonce || ciphertext || tag). Each
//! call draws a fresh 96-bit nonce, so encrypting the same plaintext twice
//! yields different output.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

const PREFIX: &str = "v1:";
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("key mismatch or corrupted ciphertext")]
    KeyMismatch,
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}

/// Symmetric cipher shared by every component that touches token material.
///
/// Immutable after construction; share it behind an `Arc`.
pub struct TokenCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| CryptoError::InvalidKey("rejected by AES-256-GCM".to_owned()))?;
        Ok(Self { key: LessSafeKey::new(unbound), rng: SystemRandom::new() })
    }

    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64_key(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("not valid base64: {e}")))?;
        Self::new(&bytes)
    }

    /// Generate a fresh random key, base64-encoded.
    pub fn generate_key() -> Result<String, CryptoError> {
        let mut key = [0u8; KEY_LEN];
        SystemRandom::new().fill(&mut key).map_err(|_| CryptoError::Encrypt)?;
        Ok(STANDARD.encode(key))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes).map_err(|_| CryptoError::Encrypt)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + in_out.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&in_out);
        Ok(format!("{PREFIX}{}", STANDARD.encode(blob)))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, CryptoError> {
        let encoded = ciphertext
            .strip_prefix(PREFIX)
            .ok_or_else(|| CryptoError::Malformed("missing version prefix".to_owned()))?;
        let blob = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::Malformed(format!("not valid base64: {e}")))?;
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Malformed(format!("too short ({} bytes)", blob.len())));
        }

        let (nonce_bytes, sealed) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CryptoError::Malformed("bad nonce".to_owned()))?;
        let mut buf = sealed.to_vec();
        let plain =
            self.key.open_in_place(nonce, Aad::empty(), &mut buf).map_err(|_| CryptoError::KeyMismatch)?;
        Ok(plain.to_vec())
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, CryptoError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_str(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let bytes = self.decrypt(ciphertext)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::Malformed("plaintext is not UTF-8".to_owned()))
    }
}

#[cfg(test)]
#[path = "crypto_tests.rs"]
mod tests;

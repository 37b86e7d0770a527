// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! At-rest encryption of resource access settings.
//!
//! Access settings (hosts, users, passwords) may be stored encrypted. Every string
//! value inside an encrypted settings document is an independent token of the form
//! `base64(nonce || ciphertext)` produced with AES-256-GCM. The key is the SHA-256
//! digest of the configured passphrase.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;

/// Errors from encrypting or decrypting access settings.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CryptoError {
    /// Settings are marked encrypted but no passphrase is configured.
    #[error("access settings are encrypted but no encryption key is configured")]
    MissingKey,

    /// A token is not valid base64 or is too short.
    #[error("malformed encrypted value: {0}")]
    Malformed(String),

    /// Authentication failed: wrong key or tampered value.
    #[error("encrypted value could not be decrypted")]
    Decrypt,

    /// Encryption failed.
    #[error("value could not be encrypted")]
    Encrypt,
}

/// Cipher for resource access settings.
#[derive(Clone)]
pub struct AccessCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for AccessCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessCipher").finish_non_exhaustive()
    }
}

impl AccessCipher {
    /// Derive a cipher from a passphrase.
    pub fn new(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&digest);
        let cipher = Aes256Gcm::new((&*key).into());
        Self { cipher }
    }

    /// Encrypt a single string into a token.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    /// Decrypt a single token.
    pub fn decrypt(&self, token: &str) -> Result<String, CryptoError> {
        let raw = STANDARD
            .decode(token.trim())
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;
        if raw.len() <= NONCE_LEN {
            return Err(CryptoError::Malformed("value is too short".to_string()));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| CryptoError::Decrypt)?,
        );

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| CryptoError::Malformed("decrypted value is not UTF-8".to_string()))
    }

    /// Decrypt every string inside a JSON document, recursing into arrays and objects.
    ///
    /// Numbers, booleans and nulls are returned unchanged.
    pub fn decrypt_value(&self, value: &Value) -> Result<Value, CryptoError> {
        Ok(match value {
            Value::String(token) => Value::String(self.decrypt(token)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.decrypt_value(item))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key.clone(), self.decrypt_value(item)?);
                }
                Value::Object(out)
            }
            other => other.clone(),
        })
    }

    /// Encrypt every string inside a JSON document.
    pub fn encrypt_value(&self, value: &Value) -> Result<Value, CryptoError> {
        Ok(match value {
            Value::String(plain) => Value::String(self.encrypt(plain)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.encrypt_value(item))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key.clone(), self.encrypt_value(item)?);
                }
                Value::Object(out)
            }
            other => other.clone(),
        })
    }
}

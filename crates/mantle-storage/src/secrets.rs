// SPDX-License-Identifier: MIT OR Apache-2.0
//! Secret-at-rest encryption and the secret store.
//!
//! AES-256-GCM with a random nonce per encryption; token format is
//! `base64(nonce || ciphertext || tag)`. The key comes from
//! `APP_SECRET_KEY`, accepted either as raw 32 bytes or urlsafe-base64.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64, engine::general_purpose::URL_SAFE as URL_BASE64};
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Nonce size for AES-GCM.
const NONCE_SIZE: usize = 12;
/// AES-256 key size.
const KEY_SIZE: usize = 32;

/// Secret handling failures. Fatal: never retried by the worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretStoreError {
    /// `APP_SECRET_KEY` is unset.
    #[error("[SECRET_KEY_MISSING] APP_SECRET_KEY is not set")]
    KeyMissing,
    /// The key is neither raw 32 bytes nor urlsafe-base64 of 32 bytes.
    #[error("[SECRET_KEY_INVALID] APP_SECRET_KEY is not a valid 32-byte key")]
    KeyInvalid,
    /// The ciphertext failed authentication or decoding.
    #[error("[SECRET_TOKEN_INVALID] invalid secret token")]
    TokenInvalid,
    /// The referenced secret does not exist.
    #[error("[SECRET_NOT_FOUND] secret {secret_ref:?} not found")]
    NotFound {
        /// The missing reference.
        secret_ref: String,
    },
    /// No reference and no environment fallback available.
    #[error("[SECRET_UNRESOLVED] {detail}")]
    Unresolved {
        /// Why resolution failed.
        detail: String,
    },
}

fn derive_key(raw: &str) -> Result<[u8; KEY_SIZE], SecretStoreError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(SecretStoreError::KeyMissing);
    }
    if raw.len() == KEY_SIZE {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(raw.as_bytes());
        return Ok(key);
    }
    let decoded = URL_BASE64
        .decode(raw)
        .or_else(|_| BASE64.decode(raw))
        .map_err(|_| SecretStoreError::KeyInvalid)?;
    let key: [u8; KEY_SIZE] = decoded
        .try_into()
        .map_err(|_| SecretStoreError::KeyInvalid)?;
    Ok(key)
}

/// Encrypt a secret value with the given key material.
///
/// # Errors
///
/// [`SecretStoreError::KeyMissing`] / [`SecretStoreError::KeyInvalid`].
pub fn encrypt_secret(value: &str, app_secret_key: &str) -> Result<String, SecretStoreError> {
    let key = derive_key(app_secret_key)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| SecretStoreError::KeyInvalid)?;
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, value.as_bytes())
        .map_err(|_| SecretStoreError::TokenInvalid)?;

    let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    payload.extend_from_slice(&nonce_bytes);
    payload.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(payload))
}

/// Decrypt a token produced by [`encrypt_secret`].
///
/// # Errors
///
/// Key errors, or [`SecretStoreError::TokenInvalid`] when authentication
/// fails.
pub fn decrypt_secret(token: &str, app_secret_key: &str) -> Result<String, SecretStoreError> {
    let key = derive_key(app_secret_key)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| SecretStoreError::KeyInvalid)?;
    let payload = BASE64
        .decode(token)
        .map_err(|_| SecretStoreError::TokenInvalid)?;
    if payload.len() <= NONCE_SIZE {
        return Err(SecretStoreError::TokenInvalid);
    }
    let (nonce_bytes, ciphertext) = payload.split_at(NONCE_SIZE);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| SecretStoreError::TokenInvalid)?;
    String::from_utf8(plaintext).map_err(|_| SecretStoreError::TokenInvalid)
}

/// Workspace-scoped secret store holding encrypted values.
#[derive(Debug, Default)]
pub struct SecretStore {
    items: Mutex<BTreeMap<(String, String), String>>,
}

impl SecretStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encrypt and store a secret; returns its reference id.
    ///
    /// # Errors
    ///
    /// Key errors.
    pub fn create(
        &self,
        workspace: &str,
        value: &str,
        app_secret_key: &str,
    ) -> Result<String, SecretStoreError> {
        let token = encrypt_secret(value, app_secret_key)?;
        let secret_ref = Uuid::new_v4().to_string();
        self.items
            .lock()
            .expect("secrets poisoned")
            .insert((workspace.to_string(), secret_ref.clone()), token);
        Ok(secret_ref)
    }

    /// Decrypt a stored secret.
    ///
    /// # Errors
    ///
    /// [`SecretStoreError::NotFound`], key errors, or token errors.
    pub fn get(
        &self,
        workspace: &str,
        secret_ref: &str,
        app_secret_key: &str,
    ) -> Result<String, SecretStoreError> {
        let token = self
            .items
            .lock()
            .expect("secrets poisoned")
            .get(&(workspace.to_string(), secret_ref.to_string()))
            .cloned()
            .ok_or_else(|| SecretStoreError::NotFound {
                secret_ref: secret_ref.to_string(),
            })?;
        decrypt_secret(&token, app_secret_key)
    }

    /// Resolve a secret: by reference when given, otherwise (in dev
    /// environments only) from the named environment variable.
    ///
    /// # Errors
    ///
    /// [`SecretStoreError`] when neither path yields a value.
    pub fn resolve(
        &self,
        workspace: &str,
        secret_ref: Option<&str>,
        app_secret_key: &str,
        app_env: &str,
        env_key: Option<&str>,
    ) -> Result<String, SecretStoreError> {
        if let Some(secret_ref) = secret_ref {
            return self.get(workspace, secret_ref, app_secret_key);
        }
        if app_env == "dev" {
            let Some(env_key) = env_key.filter(|k| !k.is_empty()) else {
                return Err(SecretStoreError::Unresolved {
                    detail: "missing env key for secret fallback".into(),
                });
            };
            let value = std::env::var(env_key).unwrap_or_default();
            if value.trim().is_empty() {
                return Err(SecretStoreError::Unresolved {
                    detail: format!("missing env secret: {env_key}"),
                });
            }
            return Ok(value.trim().to_string());
        }
        Err(SecretStoreError::Unresolved {
            detail: "secret reference required for non-dev environments".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef"; // raw 32 bytes

    #[test]
    fn encrypt_decrypt_round_trip() {
        let token = encrypt_secret("postmark-token", KEY).unwrap();
        assert_ne!(token, "postmark-token");
        assert_eq!(decrypt_secret(&token, KEY).unwrap(), "postmark-token");
    }

    #[test]
    fn tampered_tokens_fail_authentication() {
        let token = encrypt_secret("x", KEY).unwrap();
        let mut bytes = BASE64.decode(&token).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = BASE64.encode(bytes);
        assert_eq!(
            decrypt_secret(&tampered, KEY).unwrap_err(),
            SecretStoreError::TokenInvalid
        );
    }

    #[test]
    fn urlsafe_base64_keys_accepted() {
        let encoded = URL_BASE64.encode(KEY.as_bytes());
        let token = encrypt_secret("v", &encoded).unwrap();
        assert_eq!(decrypt_secret(&token, &encoded).unwrap(), "v");
    }

    #[test]
    fn bad_keys_are_fatal() {
        assert_eq!(encrypt_secret("v", "").unwrap_err(), SecretStoreError::KeyMissing);
        assert_eq!(
            encrypt_secret("v", "short").unwrap_err(),
            SecretStoreError::KeyInvalid
        );
    }

    #[test]
    fn store_resolve_paths() {
        let store = SecretStore::new();
        let secret_ref = store.create("w", "value", KEY).unwrap();
        assert_eq!(store.get("w", &secret_ref, KEY).unwrap(), "value");
        assert_eq!(
            store.get("w", "missing", KEY).unwrap_err(),
            SecretStoreError::NotFound {
                secret_ref: "missing".into()
            }
        );

        // Non-dev environments require a reference.
        let err = store.resolve("w", None, KEY, "prod", Some("X")).unwrap_err();
        assert!(matches!(err, SecretStoreError::Unresolved { .. }));
    }
}

//! ChaCha20-Poly1305 provider.

use super::CryptoProvider;
use crate::error::{ConfigError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit},
};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Self-identification tag prepended to every sealed payload. Not a secret.
pub const MARKER: &[u8] = b"HSENC1:";

/// Key length in bytes.
pub const KEY_LEN: usize = 32;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// ChaCha20-Poly1305 codec.
///
/// Wire format: `base64(MARKER || nonce || seal(plaintext))`, with a fresh
/// random nonce per call.
///
/// # Examples
///
/// ```rust
/// use hotswap_store::crypto::{ChaChaProvider, CryptoProvider};
///
/// let provider = ChaChaProvider::from_passphrase(b"correct horse battery staple");
/// let sealed = provider.encrypt(b"port: 8080").unwrap();
///
/// assert!(provider.is_encrypted(&sealed));
/// assert_eq!(provider.decrypt(&sealed).unwrap(), b"port: 8080");
/// ```
pub struct ChaChaProvider {
    cipher: ChaCha20Poly1305,
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl ChaChaProvider {
    /// Derive the key from arbitrary key material with SHA-256.
    pub fn from_passphrase(material: &[u8]) -> Self {
        let digest = Sha256::digest(material);
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&digest);
        Self::with_key(key)
    }

    /// Generate a random key from system entropy.
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key[..]);
        Self::with_key(key)
    }

    /// Use key material if supplied, otherwise generate a random key.
    pub fn new(material: Option<&[u8]>) -> Self {
        material.map_or_else(Self::generate, Self::from_passphrase)
    }

    /// Import a key previously returned by [`export_key`](CryptoProvider::export_key).
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not base64 or not exactly 32 bytes.
    pub fn import_key(encoded: &str) -> Result<Self> {
        let raw = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| ConfigError::Decryption(format!("Invalid key encoding: {e}")))?,
        );
        if raw.len() != KEY_LEN {
            return Err(ConfigError::Decryption(format!(
                "Invalid key size: {} bytes (expected {KEY_LEN})",
                raw.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&raw);
        Ok(Self::with_key(key))
    }

    /// Whether `data` carries this provider's envelope, without needing a key.
    pub fn has_marker(data: &[u8]) -> bool {
        Self::unwrap_envelope(data).is_some()
    }

    fn with_key(key: Zeroizing<[u8; KEY_LEN]>) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        Self { cipher, key }
    }

    /// Decode the text-safe envelope and strip the marker.
    fn unwrap_envelope(data: &[u8]) -> Option<Vec<u8>> {
        let text = std::str::from_utf8(data).ok()?;
        let decoded = STANDARD.decode(text.trim()).ok()?;
        decoded
            .starts_with(MARKER)
            .then(|| decoded[MARKER.len()..].to_vec())
    }
}

impl CryptoProvider for ChaChaProvider {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| ConfigError::Encryption(format!("Encryption failed: {e}")))?;

        let mut payload = Vec::with_capacity(MARKER.len() + NONCE_LEN + sealed.len());
        payload.extend_from_slice(MARKER);
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&sealed);
        Ok(STANDARD.encode(payload).into_bytes())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let body = Self::unwrap_envelope(ciphertext)
            .ok_or_else(|| ConfigError::Decryption("Encryption marker not found".to_string()))?;
        if body.len() < NONCE_LEN {
            return Err(ConfigError::Decryption(
                "Ciphertext is shorter than the nonce".to_string(),
            ));
        }

        let (nonce, sealed) = body.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| {
                ConfigError::Decryption(
                    "Authentication failed: wrong key or tampered data".to_string(),
                )
            })
    }

    fn is_encrypted(&self, data: &[u8]) -> bool {
        Self::unwrap_envelope(data).is_some()
    }

    fn export_key(&self) -> Option<String> {
        Some(STANDARD.encode(&self.key[..]))
    }
}

impl std::fmt::Debug for ChaChaProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaChaProvider").finish_non_exhaustive()
    }
}

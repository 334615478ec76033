//! Encryption at rest for persisted configuration.
//!
//! The store talks to a [`CryptoProvider`]; the default implementation is
//! [`ChaChaProvider`] (ChaCha20-Poly1305, feature `encryption`).

#[cfg(feature = "encryption")]
mod chacha;

#[cfg(feature = "encryption")]
pub use chacha::{ChaChaProvider, KEY_LEN, MARKER, NONCE_LEN};

use crate::error::Result;

/// Authenticated encryption codec used by the persistence pipeline.
///
/// Implementations must be immutable once constructed and safe to share.
pub trait CryptoProvider: Send + Sync {
    /// Seal `plaintext` into a self-identifying, text-safe payload.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Encryption`](crate::error::ConfigError::Encryption) if sealing fails.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Open a payload produced by [`encrypt`](CryptoProvider::encrypt).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Decryption`](crate::error::ConfigError::Decryption) when the
    /// marker is missing or authentication fails. Never returns partial output.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Cheap check for the encryption marker.
    fn is_encrypted(&self, data: &[u8]) -> bool;

    /// Export the raw key for rotation or backup, if the provider allows it.
    fn export_key(&self) -> Option<String> {
        None
    }
}

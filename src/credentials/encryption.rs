//! AES-256-GCM sealing of the credential record under a device-bound key.
//!
//! The key is never stored. It is re-derived on every start from the
//! hardware identifier of the machine plus a versioned salt, so a blob
//! copied to another machine simply fails to open there.
//!
//! Blob layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use super::machine;
use crate::error::CryptoError;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::warn;

/// Size of the derived key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag
const TAG_SIZE: usize = 16;

/// Mixed into the key material. Bumping the version orphans every stored blob.
const KEY_SALT: &str = "usagebar.credentials.v1";

/// Identifier used when the hardware identifier cannot be read.
///
/// Every machine in that situation derives the same key, so the file is only
/// protected against casual inspection. Logged as reduced-security mode.
pub const FALLBACK_MACHINE_ID: &str = "default";

/// Symmetric codec bound to one machine.
pub struct SecretCodec {
    key: [u8; KEY_SIZE],
    reduced_security: bool,
}

impl SecretCodec {
    /// Builds the codec for the machine this process runs on.
    ///
    /// Falls back to [`FALLBACK_MACHINE_ID`] instead of failing when the
    /// hardware identifier is unavailable.
    pub fn for_this_machine() -> Self {
        match machine::read_machine_identifier() {
            Some(identifier) => Self::from_identifier(&identifier),
            None => {
                warn!(
                    "Hardware identifier unavailable, using constant fallback key (reduced security)"
                );
                Self {
                    key: derive_key(FALLBACK_MACHINE_ID),
                    reduced_security: true,
                }
            }
        }
    }

    /// Builds a codec from an explicit machine identifier.
    pub fn from_identifier(identifier: &str) -> Self {
        Self {
            key: derive_key(identifier),
            reduced_security: false,
        }
    }

    /// True when the key came from the constant fallback identifier.
    pub fn is_reduced_security(&self) -> bool {
        self.reduced_security
    }

    /// Seals `plaintext` with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        // Generate random nonce (never reuse!)
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Opens a blob produced by [`SecretCodec::encrypt`].
    ///
    /// Fails with [`CryptoError::Integrity`] when the tag does not verify,
    /// which includes blobs sealed on a different machine.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::InvalidBlob(format!(
                "expected at least {} bytes, got {}",
                NONCE_SIZE + TAG_SIZE,
                blob.len()
            )));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::InvalidBlob(e.to_string()))?;

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Integrity)
    }

    /// [`SecretCodec::encrypt`] followed by base64, for text-safe storage.
    pub fn seal_to_text(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        self.encrypt(plaintext).map(|blob| BASE64.encode(blob))
    }

    /// Inverse of [`SecretCodec::seal_to_text`].
    pub fn open_text(&self, text: &str) -> Result<Vec<u8>, CryptoError> {
        let blob = BASE64
            .decode(text.trim())
            .map_err(|e| CryptoError::InvalidBlob(e.to_string()))?;
        self.decrypt(&blob)
    }
}

impl fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCodec")
            .field("key", &"<redacted>")
            .field("reduced_security", &self.reduced_security)
            .finish()
    }
}

/// Derives the 256-bit key for `machine_id`.
///
/// Deterministic: the same identifier always yields the same key.
pub fn derive_key(machine_id: &str) -> [u8; KEY_SIZE] {
    let material = format!("{}.{}", machine_id, KEY_SALT);
    let digest = Sha256::digest(material.as_bytes());

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&digest);
    key
}

//! WIREDKV - Encryption Envelope
//! Reversible at-rest transform applied to every record payload.
//!
//! Two strategies are provided:
//! - [`NoOpEnvelope`]: passes bytes through unchanged (encryption disabled)
//! - [`AuthenticatedEnvelope`]: AES-256-GCM with a fresh random nonce per record
//!
//! The strategy is picked once when the store is opened and shared by
//! reference with every segment. Key material belongs to the envelope
//! instance; nothing is read from process-wide state.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{DecodeError, Result, WiredError};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// 256-bit symmetric key for the authenticated envelope.
/// The bytes are wiped when the key is dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generate a random key from the OS entropy source.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Build a key from exactly [`KEY_SIZE`] raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            WiredError::Config(format!(
                "encryption key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Decode a key from standard base64.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let mut raw = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| WiredError::Config(format!("encryption key is not base64: {}", e)))?;
        let key = Self::from_bytes(&raw);
        raw.zeroize();
        key
    }

    /// Encode the key as standard base64.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.bytes)
    }

    fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Trait implemented by every at-rest payload transform.
pub trait Envelope: Send + Sync {
    /// Turn a plaintext payload into storable bytes.
    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Recover the plaintext from bytes produced by [`Envelope::encode`].
    fn decode(&self, stored: &[u8]) -> std::result::Result<Vec<u8>, DecodeError>;

    /// Bytes added on top of the plaintext by `encode`.
    fn overhead(&self) -> usize;

    /// Returns the human-readable name of this envelope.
    fn name(&self) -> &str;
}

/// Identity envelope used when encryption is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEnvelope;

impl Envelope for NoOpEnvelope {
    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decode(&self, stored: &[u8]) -> std::result::Result<Vec<u8>, DecodeError> {
        Ok(stored.to_vec())
    }

    fn overhead(&self) -> usize {
        0
    }

    fn name(&self) -> &str {
        "none"
    }
}

/// AES-256-GCM envelope.
///
/// ## Output Format
/// ```text
/// [nonce: 12 bytes][ciphertext: N bytes][tag: 16 bytes]
/// ```
pub struct AuthenticatedEnvelope {
    cipher: Aes256Gcm,
}

impl AuthenticatedEnvelope {
    /// Bind a new envelope to `key` for its whole lifetime.
    pub fn new(key: &EncryptionKey) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        Self { cipher }
    }
}

impl std::fmt::Debug for AuthenticatedEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedEnvelope")
            .field("cipher", &"Aes256Gcm")
            .finish()
    }
}

impl Envelope for AuthenticatedEnvelope {
    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| WiredError::Encode(format!("entropy source exhausted: {}", e)))?;

        // aes-gcm returns ciphertext || tag
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| WiredError::Encode("aes-gcm encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decode(&self, stored: &[u8]) -> std::result::Result<Vec<u8>, DecodeError> {
        if stored.len() < NONCE_SIZE + TAG_SIZE {
            return Err(DecodeError::Malformed(format!(
                "envelope input of {} bytes cannot hold nonce and tag",
                stored.len()
            )));
        }
        let (nonce, sealed) = stored.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| DecodeError::AuthenticationFailed)
    }

    fn overhead(&self) -> usize {
        NONCE_SIZE + TAG_SIZE
    }

    fn name(&self) -> &str {
        "aes-256-gcm"
    }
}

/// Pick the envelope for an optional key: authenticated when a key is
/// configured, pass-through otherwise.
pub fn envelope_for(key: Option<&EncryptionKey>) -> Box<dyn Envelope> {
    match key {
        Some(key) => Box::new(AuthenticatedEnvelope::new(key)),
        None => Box::new(NoOpEnvelope),
    }
}

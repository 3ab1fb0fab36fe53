//! WIREDKV - Custom Error Types
//! Defines the error hierarchy for the segment storage engine.

use thiserror::Error;

/// Custom Result type for the WiredKV engine.
pub type Result<T> = std::result::Result<T, WiredError>;

/// Reasons a stored record could not be turned back into an entity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The record declares more bytes than are available.
    #[error("truncated record: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// The envelope tag did not verify (corruption or wrong key).
    #[error("envelope authentication failed")]
    AuthenticationFailed,

    /// The bytes are complete but do not parse as a record payload.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Error types for the WiredKV storage engine.
#[derive(Error, Debug)]
pub enum WiredError {
    /// Unknown segment or entity key.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The codec or envelope could not produce storable bytes.
    #[error("Encode failure: {0}")]
    Encode(String),

    /// A stored record could not be decoded.
    #[error("Decode failure: {0}")]
    Decode(#[from] DecodeError),

    /// I/O error while appending records to a segment file.
    #[error("Write failure: {0}")]
    Write(#[source] std::io::Error),

    /// Caller-supplied segment data failed validation.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// I/O errors from other file operations (open, read, remove).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl WiredError {
    /// Returns true for failures caused by the caller's request
    /// (client-error responses in the external layer).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            WiredError::NotFound(_) | WiredError::MalformedRequest(_)
        )
    }

    /// Message safe to hand back to a remote caller.
    /// Server-side failures collapse to a generic text so neither
    /// offsets nor cryptographic details leave the process.
    pub fn public_message(&self) -> String {
        match self {
            WiredError::NotFound(_) | WiredError::MalformedRequest(_) => self.to_string(),
            _ => "internal storage error".to_string(),
        }
    }
}

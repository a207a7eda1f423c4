//! Error taxonomy shared by the usage client, the polling controller and
//! the extraction flow.
//!
//! Plumbing failures (file I/O, config parsing) stay on `anyhow`; the types
//! here are the ones callers have to match on.

use thiserror::Error;

/// Failure of a single usage fetch.
///
/// `Clone + PartialEq` so the polling controller can keep the last one
/// around as display state.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UsageError {
    /// No complete credential record is stored. Checked before any request.
    #[error("No credentials configured")]
    NoCredentials,

    /// The provider answered 401/403: the session key is invalid or expired.
    #[error("Session expired - please sign in again")]
    Unauthorized,

    /// Any other non-success status.
    #[error("Unexpected response status {0}")]
    UnexpectedStatus(u16),

    /// DNS, connect, timeout or reset.
    #[error("Network error: {0}")]
    Network(String),

    /// The body was not the expected usage shape.
    #[error("Failed to parse response: {0}")]
    Decode(String),
}

impl UsageError {
    /// True only for the error that should send the user back to sign-in.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, UsageError::Unauthorized)
    }

    /// Errors that are expected to clear up on the next scheduled tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UsageError::UnexpectedStatus(_) | UsageError::Network(_) | UsageError::Decode(_)
        )
    }
}

impl From<reqwest::Error> for UsageError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            UsageError::Decode(err.to_string())
        } else {
            UsageError::Network(err.to_string())
        }
    }
}

/// Authenticated encryption failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// The blob is too short or not valid base64 to begin with.
    #[error("Encrypted blob is malformed: {0}")]
    InvalidBlob(String),

    /// Tag verification failed: tampered, corrupted, or sealed under another key.
    #[error("Decryption failed (wrong key or corrupted data)")]
    Integrity,

    #[error("Encryption failed: {0}")]
    Encrypt(String),
}

/// Failure surfaced by the session extraction flow.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
    /// The probe never produced both values within the attempt ceiling.
    #[error("Automatic sign-in gave up after {attempts} attempts")]
    Exhausted { attempts: u32 },

    /// Manual entry submitted with a blank session key or organization id.
    #[error("Both the session key and the organization id are required")]
    ManualEntryIncomplete,

    #[error("No browser surface is attached; use manual entry")]
    NoBrowserSurface,

    #[error("Browser surface error: {0}")]
    Browser(String),

    /// The credential sink refused the extracted values.
    #[error("Failed to save credentials: {0}")]
    Sink(String),
}

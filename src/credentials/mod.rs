//! Encrypted, device-bound storage for the provider session.
//!
//! Holds exactly one credential pair: the session key cookie value and the
//! organization id that addresses the usage endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - get / set / clear                     │
//! │  - in-memory cache, serialized writes    │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SecretCodec                        │
//! │  - AES-256-GCM                           │
//! │  - key derived from machine identifier   │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       credentials.enc                    │
//! │  - base64(nonce || ciphertext || tag)    │
//! │  - replaced atomically (tmp + rename)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use usagebar::credentials::{CredentialStore, SecretCodec};
//!
//! # fn main() -> anyhow::Result<()> {
//! let store = CredentialStore::open("credentials.enc", SecretCodec::for_this_machine());
//!
//! store.set("sk-ant-sid01-...", "263e9fcb-52b9-4372-8842-...")?;
//! if let Some(record) = store.get() {
//!     println!("Organization: {}", record.organization_id);
//! }
//!
//! store.clear()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - The key never touches disk; it is re-derived from the hardware identifier
//! - A file copied to another machine fails authentication and reads as absent
//! - When no hardware identifier is readable a constant fallback key is used
//!   and a warning is logged (reduced-security mode)

use serde::{Deserialize, Serialize};
use std::fmt;

mod encryption;
mod machine;
mod storage;

pub use encryption::{derive_key, SecretCodec, FALLBACK_MACHINE_ID};
pub use machine::read_machine_identifier;
pub use storage::{CredentialEvent, CredentialStore};

/// Name of the provider cookie carrying the session key.
pub const SESSION_COOKIE_NAME: &str = "sessionKey";

/// The single credential pair.
///
/// Either complete or absent: the only constructor rejects blank fields,
/// so a half-filled record cannot be built or persisted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Session key cookie value (secret)
    pub session_key: String,

    /// Provider-scoped organization id
    pub organization_id: String,
}

impl CredentialRecord {
    /// Trims both values; `None` if either is blank afterwards.
    pub fn new(session_key: &str, organization_id: &str) -> Option<Self> {
        let session_key = session_key.trim();
        let organization_id = organization_id.trim();

        if session_key.is_empty() || organization_id.is_empty() {
            return None;
        }

        Some(Self {
            session_key: session_key.to_string(),
            organization_id: organization_id.to_string(),
        })
    }

    /// `Cookie` header value authenticating provider requests.
    pub fn cookie_header(&self) -> String {
        format!("{}={}", SESSION_COOKIE_NAME, self.session_key)
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("session_key", &fingerprint(&self.session_key))
            .field("organization_id", &self.organization_id)
            .finish()
    }
}

/// Log-safe rendering of a secret: first four characters and the length.
pub fn fingerprint(secret: &str) -> String {
    let prefix: String = secret.chars().take(4).collect();
    format!("{}…({} chars)", prefix, secret.chars().count())
}

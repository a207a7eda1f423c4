// Configuration (TOML + environment overrides)
pub mod config;

// Encrypted, device-bound credential storage
pub mod credentials;

// Error taxonomy
pub mod error;

// Browser-driven session extraction
pub mod extraction;

// Usage polling and refresh control
pub mod polling;

// Cancellable scheduled tasks
pub mod schedule;

// Usage model, HTTP client and display helpers
pub mod usage;

pub use config::UsageBarConfig;
pub use credentials::{CredentialRecord, CredentialStore, SecretCodec};
pub use error::{CryptoError, ExtractionError, UsageError};
pub use extraction::{ExtractionFlow, ExtractionState};
pub use polling::{PollingController, PollingEvent};
pub use usage::{UsageClient, UsageSnapshot};

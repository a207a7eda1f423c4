//! File-backed credential store.
//!
//! The record is serialized to JSON, sealed by [`SecretCodec`] and written
//! to a single file. Every save rewrites the whole file through a temp file
//! and a rename, so a reader sees the old record or the new one, never a mix.

use super::{fingerprint, CredentialRecord, SecretCodec};
use anyhow::{anyhow, Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Change notification published by [`CredentialStore`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialEvent {
    /// A complete record was written.
    Saved,
    /// The record was removed.
    Cleared,
}

/// What the store knows about the file.
enum CacheState {
    /// Not read yet in this process.
    Unloaded,
    /// Read (or written) at least once; `None` means signed out.
    Loaded(Option<CredentialRecord>),
}

/// Single owner of the credential record.
///
/// # Thread Safety
/// - All reads and writes go through one mutex, so `set`/`clear` never
///   interleave and `get` never observes a half-applied update
/// - Decryption happens at most once per process; later reads hit the cache
pub struct CredentialStore {
    path: PathBuf,
    codec: SecretCodec,
    cache: Mutex<CacheState>,
    events_tx: broadcast::Sender<CredentialEvent>,
}

impl CredentialStore {
    /// Creates a store backed by `path`. Nothing is read until the first `get`.
    pub fn open<P: Into<PathBuf>>(path: P, codec: SecretCodec) -> Self {
        let (events_tx, _) = broadcast::channel(16);

        Self {
            path: path.into(),
            codec,
            cache: Mutex::new(CacheState::Unloaded),
            events_tx,
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current record, loading and decrypting it on first use.
    ///
    /// A missing, unreadable, corrupted or foreign-machine file yields `None`.
    pub fn get(&self) -> Option<CredentialRecord> {
        let mut cache = self.lock_cache();

        if let CacheState::Loaded(record) = &*cache {
            return record.clone();
        }

        let record = self.load_from_disk();
        *cache = CacheState::Loaded(record.clone());
        record
    }

    /// True when a complete record is stored.
    pub fn has_credentials(&self) -> bool {
        self.get().is_some()
    }

    /// Replaces the stored record.
    ///
    /// Both values are trimmed; blank values are rejected without touching
    /// the file or the cache.
    pub fn set(&self, session_key: &str, organization_id: &str) -> Result<CredentialRecord> {
        let record = CredentialRecord::new(session_key, organization_id).ok_or_else(|| {
            anyhow!("Both the session key and the organization id must be non-empty")
        })?;

        {
            let mut cache = self.lock_cache();
            self.write_to_disk(&record)?;
            *cache = CacheState::Loaded(Some(record.clone()));
        }

        info!(
            session_key = %fingerprint(&record.session_key),
            organization_id = %record.organization_id,
            path = %self.path.display(),
            "Credentials saved"
        );
        let _ = self.events_tx.send(CredentialEvent::Saved);

        Ok(record)
    }

    /// Removes the backing file and the cached record.
    ///
    /// Clearing an already empty store is a no-op.
    pub fn clear(&self) -> Result<()> {
        {
            let mut cache = self.lock_cache();

            match fs::remove_file(&self.path) {
                Ok(()) => info!(path = %self.path.display(), "Credentials cleared"),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(path = %self.path.display(), "No credential file to clear")
                }
                Err(e) => {
                    return Err(e).context(format!(
                        "Failed to remove credential file {}",
                        self.path.display()
                    ))
                }
            }

            *cache = CacheState::Loaded(None);
        }

        let _ = self.events_tx.send(CredentialEvent::Cleared);
        Ok(())
    }

    /// Subscribe to save/clear notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CredentialEvent> {
        self.events_tx.subscribe()
    }

    fn lock_cache(&self) -> MutexGuard<'_, CacheState> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_from_disk(&self) -> Option<CredentialRecord> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No stored credentials");
                return None;
            }
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "Failed to read credential file");
                return None;
            }
        };

        let plaintext = match self.codec.open_text(&text) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(
                    error = %e,
                    path = %self.path.display(),
                    "Stored credentials could not be decrypted, treating as signed out"
                );
                return None;
            }
        };

        match serde_json::from_slice::<CredentialRecord>(&plaintext) {
            Ok(stored) => CredentialRecord::new(&stored.session_key, &stored.organization_id),
            Err(e) => {
                warn!(error = %e, "Decrypted credentials are not a valid record");
                None
            }
        }
    }

    /// Atomic replace: write a uniquely named temp file, fsync, rename.
    fn write_to_disk(&self, record: &CredentialRecord) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("Failed to create credential directory")?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
            }
        }

        let json = serde_json::to_vec(record).context("Failed to serialize credentials")?;
        let sealed = self
            .codec
            .seal_to_text(&json)
            .context("Failed to encrypt credentials")?;

        let tmp_path = self
            .path
            .with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

        let written = (|| -> Result<()> {
            let mut options = OpenOptions::new();
            options.create(true).truncate(true).write(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }

            let mut file = options
                .open(&tmp_path)
                .context("Failed to create temporary credential file")?;
            file.write_all(sealed.as_bytes())
                .context("Failed to write temporary credential file")?;
            file.sync_all()
                .context("Failed to sync credential file to disk")?;

            fs::rename(&tmp_path, &self.path).context("Failed to replace credential file")
        })();

        if written.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        written
    }
}

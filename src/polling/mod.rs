//! Polling controller - Keeps the usage snapshot fresh.
//!
//! Owns the repeating refresh timer, gates fetches behind a single-flight
//! guard, classifies failures and publishes state changes.
//!
//! # Lifecycle
//!
//! ```text
//! start_auto_refresh ──► immediate refresh ──► tick every interval ──► refresh
//!        ▲                                                                │
//!        └──────── set_interval (clamped) restarts the timer ◄────────────┘
//!
//! stop_auto_refresh / shutdown ──► timer aborted
//!                                  (in-flight fetch finishes; after shutdown its
//!                                   result is discarded)
//!
//! save_credentials / clear_credentials ──► credential generation bumped
//!                                          (a fetch started under the previous
//!                                           credentials is discarded)
//! ```
//!
//! Credential file I/O runs on the blocking pool so the runtime's worker
//! threads only wait on the network.

use crate::config::PollingConfig;
use crate::credentials::{CredentialRecord, CredentialStore};
use crate::error::UsageError;
use crate::extraction::CredentialSink;
use crate::schedule::TaskSlot;
use crate::usage::display::{self, DisplayMode};
use crate::usage::{UsageFetcher, UsageSnapshot};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[cfg(test)]
mod tests;

/// Display-facing state of the controller.
#[derive(Debug, Clone)]
pub struct PollingState {
    /// Latest successful snapshot, or the placeholder
    pub snapshot: UsageSnapshot,
    pub is_loading: bool,
    /// Failure of the most recent fetch; cleared when a fetch starts
    pub last_error: Option<UsageError>,
    /// When `snapshot` was last replaced by a successful fetch
    pub last_updated: Option<DateTime<Utc>>,
    /// Effective (clamped) refresh interval
    pub interval_seconds: u64,
}

impl PollingState {
    fn new(interval_seconds: u64) -> Self {
        Self {
            snapshot: UsageSnapshot::default(),
            is_loading: false,
            last_error: None,
            last_updated: None,
            interval_seconds,
        }
    }

    /// True only when the last fetch was rejected as unauthorized.
    pub fn needs_reauthentication(&self) -> bool {
        self.last_error
            .as_ref()
            .map(UsageError::is_unauthorized)
            .unwrap_or(false)
    }

    /// True while the very first fetch has not completed yet.
    pub fn first_fetch_pending(&self) -> bool {
        self.is_loading && self.last_updated.is_none()
    }
}

/// Change notification published by [`PollingController`].
#[derive(Debug, Clone, PartialEq)]
pub enum PollingEvent {
    LoadingChanged(bool),
    SnapshotUpdated,
    FetchFailed(UsageError),
    IntervalChanged(u64),
    CredentialsCleared,
}

/// What a single [`PollingController::refresh`] call did.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// Another refresh was already in flight; this call was absorbed.
    Skipped,
    Updated,
    Failed(UsageError),
    /// The controller was shut down before the result arrived.
    Discarded,
}

/// Polling/refresh controller.
///
/// # Thread Safety
/// - `in_flight` is the single-flight guard; at most one fetch runs at a time.
///   It is a watch channel so callers can wait for the running fetch to end
/// - `credential_generation` only changes while `state` is locked, and a
///   fetch result is checked against it under the same lock
/// - `state` is only held for short, non-async sections
/// - The timer task keeps a `Weak` reference, so dropping the last `Arc`
///   stops polling
pub struct PollingController {
    store: Arc<CredentialStore>,
    fetcher: Arc<dyn UsageFetcher>,
    limits: PollingConfig,
    state: Mutex<PollingState>,
    in_flight: watch::Sender<bool>,
    credential_generation: AtomicU64,
    torn_down: AtomicBool,
    timer: TaskSlot,
    events_tx: broadcast::Sender<PollingEvent>,
}

impl PollingController {
    /// Creates a controller. Nothing is fetched until `refresh` or
    /// `start_auto_refresh` is called.
    pub fn new(
        store: Arc<CredentialStore>,
        fetcher: Arc<dyn UsageFetcher>,
        limits: PollingConfig,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        let (in_flight, _) = watch::channel(false);
        let interval_seconds = limits.effective_interval();

        Self {
            store,
            fetcher,
            limits,
            state: Mutex::new(PollingState::new(interval_seconds)),
            in_flight,
            credential_generation: AtomicU64::new(0),
            torn_down: AtomicBool::new(false),
            timer: TaskSlot::new(),
            events_tx,
        }
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<PollingEvent> {
        self.events_tx.subscribe()
    }

    /// Copy of the current state.
    pub fn state(&self) -> PollingState {
        self.lock_state().clone()
    }

    pub fn interval_seconds(&self) -> u64 {
        self.lock_state().interval_seconds
    }

    pub fn has_credentials(&self) -> bool {
        self.store.has_credentials()
    }

    pub fn needs_reauthentication(&self) -> bool {
        self.lock_state().needs_reauthentication()
    }

    pub fn is_auto_refreshing(&self) -> bool {
        self.timer.is_armed()
    }

    /// Indicator text for the current state.
    pub fn indicator_text(&self, mode: DisplayMode) -> String {
        let has_credentials = self.has_credentials();
        let state = self.lock_state();
        display::indicator_text(
            has_credentials,
            state.first_fetch_pending(),
            &state.snapshot,
            mode,
        )
    }

    /// Fetches usage once.
    ///
    /// A call made while another is in flight returns `Skipped` immediately.
    /// On failure the previous snapshot is kept. A result that arrives after
    /// the credentials were saved or cleared is discarded.
    pub async fn refresh(&self) -> RefreshOutcome {
        if self.torn_down.load(Ordering::Acquire) {
            return RefreshOutcome::Discarded;
        }

        let acquired = self.in_flight.send_if_modified(|busy| {
            if *busy {
                return false;
            }
            *busy = true;
            true
        });
        if !acquired {
            debug!("Refresh already in flight, skipping");
            return RefreshOutcome::Skipped;
        }

        let _flight = FlightGuard { controller: self };
        {
            let mut state = self.lock_state();
            state.is_loading = true;
            state.last_error = None;
        }
        self.publish(PollingEvent::LoadingChanged(true));

        // Generation first: a save landing between the two reads only
        // discards a result that was already fresh
        let generation = self.credential_generation.load(Ordering::Acquire);
        let credentials = self.read_credentials().await;
        let result = self.fetcher.fetch(credentials.as_ref()).await;

        if self.torn_down.load(Ordering::Acquire) {
            debug!("Controller shut down during fetch, discarding result");
            return RefreshOutcome::Discarded;
        }

        let mut state = self.lock_state();
        if self.credential_generation.load(Ordering::Acquire) != generation {
            drop(state);
            debug!("Credentials changed during fetch, discarding result");
            return RefreshOutcome::Discarded;
        }

        match result {
            Ok(snapshot) => {
                state.last_updated = Some(snapshot.fetched_at);
                state.snapshot = snapshot;
                state.last_error = None;
                drop(state);

                debug!("Usage snapshot updated");
                self.publish(PollingEvent::SnapshotUpdated);
                RefreshOutcome::Updated
            }
            Err(e) => {
                state.last_error = Some(e.clone());
                drop(state);

                log_fetch_failure(&e);
                self.publish(PollingEvent::FetchFailed(e.clone()));
                RefreshOutcome::Failed(e)
            }
        }
    }

    /// Refreshes with whatever credentials are stored now.
    ///
    /// When another fetch is in flight this waits for it to finish and then
    /// fetches again, instead of being absorbed by it.
    pub async fn refresh_now(&self) -> RefreshOutcome {
        loop {
            match self.refresh().await {
                RefreshOutcome::Skipped => self.wait_until_idle().await,
                outcome => return outcome,
            }
        }
    }

    async fn wait_until_idle(&self) {
        let mut in_flight = self.in_flight.subscribe();
        // Cannot fail: the sender lives as long as `self`
        let _ = in_flight.wait_for(|busy| !*busy).await;
    }

    /// Reads the stored record off the runtime's worker threads.
    async fn read_credentials(&self) -> Option<CredentialRecord> {
        let store = Arc::clone(&self.store);
        match task::spawn_blocking(move || store.get()).await {
            Ok(record) => record,
            Err(e) => {
                error!(error = %e, "Credential load task failed");
                None
            }
        }
    }

    /// Triggers an immediate refresh and arms the repeating timer.
    ///
    /// Any previously armed timer is aborted first.
    pub fn start_auto_refresh(self: &Arc<Self>) {
        if self.torn_down.load(Ordering::Acquire) {
            warn!("Ignoring start_auto_refresh on a shut down controller");
            return;
        }

        let interval_seconds = self.interval_seconds();
        let period = Duration::from_secs(interval_seconds);
        let controller = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            if !spawn_refresh(&controller) {
                return;
            }

            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if !spawn_refresh(&controller) {
                    break;
                }
            }
        });

        if self.timer.replace(handle) {
            debug!("Replaced existing refresh timer");
        }
        info!(interval_seconds, "Auto-refresh started");
    }

    /// Cancels the timer. A fetch already in flight is left to complete.
    pub fn stop_auto_refresh(&self) {
        if self.timer.cancel() {
            info!("Auto-refresh stopped");
        }
    }

    /// Clamps `seconds` to the configured bounds and restarts auto-refresh.
    ///
    /// Returns the effective interval.
    pub fn set_interval(self: &Arc<Self>, seconds: u64) -> u64 {
        let effective = self.limits.clamp(seconds);
        self.lock_state().interval_seconds = effective;

        info!(
            requested_seconds = seconds,
            interval_seconds = effective,
            "Refresh interval changed"
        );
        self.publish(PollingEvent::IntervalChanged(effective));

        self.start_auto_refresh();
        effective
    }

    /// Stops polling for good. Results of fetches still in flight are discarded.
    pub fn shutdown(&self) {
        self.torn_down.store(true, Ordering::Release);
        self.timer.cancel();
        info!("Polling controller shut down");
    }

    /// Saves credentials, then refreshes immediately.
    ///
    /// A fetch still running with the previous credentials is discarded and
    /// followed by one with the new record.
    pub async fn save_credentials(
        &self,
        session_key: &str,
        organization_id: &str,
    ) -> Result<CredentialRecord> {
        let store = Arc::clone(&self.store);
        let session_key = session_key.to_string();
        let organization_id = organization_id.to_string();
        let record = task::spawn_blocking(move || store.set(&session_key, &organization_id))
            .await
            .context("Credential save task failed")??;

        {
            let _state = self.lock_state();
            self.credential_generation.fetch_add(1, Ordering::AcqRel);
        }

        let outcome = self.refresh_now().await;
        debug!(?outcome, "Refresh after saving credentials");

        Ok(record)
    }

    /// Signs out: removes the stored credentials and resets the display state.
    pub fn clear_credentials(&self) -> Result<()> {
        self.store.clear()?;

        {
            let mut state = self.lock_state();
            self.credential_generation.fetch_add(1, Ordering::AcqRel);
            state.snapshot = UsageSnapshot::default();
            state.last_updated = None;
            state.last_error = Some(UsageError::NoCredentials);
        }
        self.publish(PollingEvent::CredentialsCleared);

        Ok(())
    }

    fn publish(&self, event: PollingEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn lock_state(&self) -> MutexGuard<'_, PollingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CredentialSink for PollingController {
    async fn deliver(&self, session_key: &str, organization_id: &str) -> Result<()> {
        self.save_credentials(session_key, organization_id)
            .await
            .map(|_| ())
    }
}

/// Releases the single-flight guard however `refresh` exits.
struct FlightGuard<'a> {
    controller: &'a PollingController,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.controller.lock_state().is_loading = false;
        self.controller.in_flight.send_replace(false);
        self.controller.publish(PollingEvent::LoadingChanged(false));
    }
}

/// Runs one refresh as its own task so aborting the timer never cancels a
/// fetch midway. Returns false once the controller is gone.
fn spawn_refresh(controller: &Weak<PollingController>) -> bool {
    let Some(controller) = controller.upgrade() else {
        return false;
    };
    if controller.torn_down.load(Ordering::Acquire) {
        return false;
    }

    tokio::spawn(async move {
        controller.refresh().await;
    });
    true
}

fn log_fetch_failure(err: &UsageError) {
    match err {
        UsageError::NoCredentials => info!("No credentials configured, skipping usage fetch"),
        UsageError::Unauthorized => {
            warn!(error = %err, "Usage fetch unauthorized, re-authentication required")
        }
        UsageError::UnexpectedStatus(status) => {
            error!(status = *status, error = %err, "Usage fetch failed")
        }
        UsageError::Network(_) | UsageError::Decode(_) => {
            error!(error = %err, "Usage fetch failed")
        }
    }
}

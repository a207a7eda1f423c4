use super::{
    is_signed_in_url, probe_script, BrowserSurface, CredentialSink, ExtractionState,
    ExtractionStatus, ProbeReport,
};
use crate::config::ExtractionConfig;
use crate::credentials::fingerprint;
use crate::error::ExtractionError;
use crate::schedule::TaskSlot;
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct FlowInner {
    state: ExtractionState,
    /// Id of the attempt whose probe results may still be applied
    attempt_id: Option<Uuid>,
}

/// Sign-in state machine.
///
/// One probe task at most: every (re)start and every cancellation aborts the
/// previous task and mints a new attempt id, and a probe whose id no longer
/// matches has its results dropped.
pub struct ExtractionFlow {
    config: ExtractionConfig,
    surface: Option<Arc<dyn BrowserSurface>>,
    sink: Arc<dyn CredentialSink>,
    inner: Mutex<FlowInner>,
    probe: TaskSlot,
    status_tx: broadcast::Sender<ExtractionStatus>,
}

impl ExtractionFlow {
    /// Creates a flow. Without a surface only manual entry is available.
    pub fn new(
        config: ExtractionConfig,
        surface: Option<Arc<dyn BrowserSurface>>,
        sink: Arc<dyn CredentialSink>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(32);

        Self {
            config,
            surface,
            sink,
            inner: Mutex::new(FlowInner {
                state: ExtractionState::Idle,
                attempt_id: None,
            }),
            probe: TaskSlot::new(),
            status_tx,
        }
    }

    pub fn state(&self) -> ExtractionState {
        self.lock_inner().state
    }

    pub fn has_browser_surface(&self) -> bool {
        self.surface.is_some()
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ExtractionStatus> {
        self.status_tx.subscribe()
    }

    /// Starts automatic sign-in by opening the sign-in page.
    ///
    /// Restarting while an attempt is running abandons that attempt.
    pub async fn begin(&self) -> Result<Uuid, ExtractionError> {
        let Some(surface) = self.surface.clone() else {
            return Err(ExtractionError::NoBrowserSurface);
        };

        self.probe.cancel();
        let attempt_id = Uuid::new_v4();
        {
            let mut inner = self.lock_inner();
            inner.attempt_id = Some(attempt_id);
            self.transition(
                &mut inner,
                ExtractionState::BrowserLoading,
                "Loading sign-in page...",
            );
        }
        info!(attempt_id = %attempt_id, url = %self.config.sign_in_url, "Starting automatic sign-in");

        if let Err(e) = surface.open_isolated(&self.config.sign_in_url).await {
            warn!(error = %e, "Failed to open sign-in page");
            let mut inner = self.lock_inner();
            if inner.attempt_id == Some(attempt_id) {
                inner.attempt_id = None;
                self.transition(
                    &mut inner,
                    ExtractionState::ManualFallback,
                    "Could not open the sign-in page. Enter your credentials manually.",
                );
            }
            return Err(ExtractionError::Browser(e.to_string()));
        }

        Ok(attempt_id)
    }

    /// Feeds a completed navigation of the browser surface into the flow.
    ///
    /// Leaving the sign-in pages while staying on the provider starts the
    /// extraction probe.
    pub fn on_navigation(self: &Arc<Self>, url: &str) {
        let attempt_id = {
            let mut inner = self.lock_inner();
            if !matches!(
                inner.state,
                ExtractionState::BrowserLoading | ExtractionState::AwaitingSignIn
            ) {
                debug!(state = %inner.state, url, "Ignoring navigation");
                return;
            }
            let Some(attempt_id) = inner.attempt_id else {
                return;
            };

            if !is_signed_in_url(url, &self.config.provider_host) {
                if inner.state == ExtractionState::BrowserLoading {
                    self.transition(
                        &mut inner,
                        ExtractionState::AwaitingSignIn,
                        "Sign in to continue",
                    );
                }
                return;
            }

            self.transition(
                &mut inner,
                ExtractionState::Extracting { attempt: 0 },
                "Signed in, reading session...",
            );
            attempt_id
        };

        let flow = Arc::clone(self);
        self.probe.replace(tokio::spawn(async move {
            flow.run_probe_loop(attempt_id).await;
        }));
    }

    /// Switches to manual entry, abandoning any running attempt.
    pub fn enter_manual_fallback(&self) {
        self.probe.cancel();
        let mut inner = self.lock_inner();
        inner.attempt_id = None;
        self.transition(
            &mut inner,
            ExtractionState::ManualFallback,
            "Enter your session key and organization id",
        );
    }

    /// Accepts credentials typed in by the user. Allowed in any state.
    ///
    /// Blank values are rejected and leave the state unchanged.
    pub async fn submit_manual(
        &self,
        session_key: &str,
        organization_id: &str,
    ) -> Result<(), ExtractionError> {
        let session_key = session_key.trim();
        let organization_id = organization_id.trim();
        if session_key.is_empty() || organization_id.is_empty() {
            return Err(ExtractionError::ManualEntryIncomplete);
        }

        self.probe.cancel();
        {
            let mut inner = self.lock_inner();
            inner.attempt_id = None;
            self.transition(&mut inner, ExtractionState::Succeeded, "Saving credentials...");
        }
        info!(
            session_key = %fingerprint(session_key),
            organization_id,
            "Manual credentials submitted"
        );

        self.finish(session_key, organization_id).await
    }

    /// Abandons the attempt and closes the browser surface.
    pub async fn cancel(&self) {
        self.reset_to_idle("Sign-in cancelled");
        if let Some(surface) = &self.surface {
            surface.close().await;
        }
    }

    /// The host reports that the user closed the browser surface.
    pub fn on_surface_closed(&self) {
        self.reset_to_idle("Sign-in window closed");
    }

    fn reset_to_idle(&self, message: &str) {
        self.probe.cancel();
        let mut inner = self.lock_inner();
        inner.attempt_id = None;
        if inner.state != ExtractionState::Idle {
            self.transition(&mut inner, ExtractionState::Idle, message);
        }
    }

    async fn run_probe_loop(self: Arc<Self>, attempt_id: Uuid) {
        let Some(surface) = self.surface.clone() else {
            return;
        };
        let max_attempts = self.config.max_attempts.max(1);
        let script = probe_script(&self.config.session_cookie_name);

        for attempt in 1..=max_attempts {
            let message = format!("Reading session (attempt {}/{})...", attempt, max_attempts);
            if !self.transition_if_current(
                attempt_id,
                ExtractionState::Extracting { attempt },
                &message,
            ) {
                return;
            }

            match self.probe_once(surface.as_ref(), &script).await {
                Ok(Some((session_key, organization_id))) => {
                    if !self.transition_if_current(
                        attempt_id,
                        ExtractionState::Succeeded,
                        "Signed in, saving credentials...",
                    ) {
                        debug!(attempt_id = %attempt_id, "Discarding stale probe result");
                        return;
                    }
                    self.clear_attempt(attempt_id);
                    info!(attempt, "Session extracted");

                    // Detached so that closing the surface cannot cut the save short
                    let flow = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _ = flow.finish(&session_key, &organization_id).await;
                    });
                    return;
                }
                Ok(None) => debug!(attempt, "Probe incomplete"),
                Err(e) => debug!(attempt, error = %e, "Probe failed"),
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
        }

        let message = format!(
            "Automatic sign-in failed after {} attempts. Enter your session key manually.",
            max_attempts
        );
        if self.transition_if_current(
            attempt_id,
            ExtractionState::Failed {
                attempts: max_attempts,
            },
            &message,
        ) {
            self.clear_attempt(attempt_id);
            let exhausted = ExtractionError::Exhausted {
                attempts: max_attempts,
            };
            warn!(error = %exhausted, "Session extraction exhausted");
        }
    }

    /// Runs the in-page probe, falling back to the cookie store for the
    /// session key when the page could not read it.
    async fn probe_once(
        &self,
        surface: &dyn BrowserSurface,
        script: &str,
    ) -> Result<Option<(String, String)>> {
        let value = surface
            .evaluate_script(script)
            .await
            .context("Probe script failed")?;
        let report: ProbeReport =
            serde_json::from_value(value).context("Probe returned an unexpected shape")?;

        if let Some(status) = report.status {
            debug!(status, "Organizations request rejected in page");
        }
        if let Some(error) = &report.error {
            debug!(error = %error, "Organizations request errored in page");
        }

        let Some(organization_id) = report.organization_id().map(str::to_string) else {
            return Ok(None);
        };

        if let Some(session_key) = report.session_key() {
            return Ok(Some((session_key.to_string(), organization_id)));
        }

        let session_key = surface
            .cookies()
            .await
            .context("Failed to read browser cookies")?
            .into_iter()
            .find(|cookie| {
                cookie.name == self.config.session_cookie_name && !cookie.value.trim().is_empty()
            })
            .map(|cookie| cookie.value.trim().to_string());

        Ok(session_key.map(|key| (key, organization_id)))
    }

    /// Hands the pair to the sink and closes the surface.
    async fn finish(&self, session_key: &str, organization_id: &str) -> Result<(), ExtractionError> {
        let delivered = self.sink.deliver(session_key, organization_id).await;

        if let Some(surface) = &self.surface {
            surface.close().await;
        }

        match delivered {
            Ok(()) => {
                if self.state() == ExtractionState::Succeeded {
                    self.publish(ExtractionState::Succeeded, "Signed in");
                }
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to save extracted credentials");
                let mut inner = self.lock_inner();
                if inner.state == ExtractionState::Succeeded {
                    self.transition(
                        &mut inner,
                        ExtractionState::ManualFallback,
                        &format!("Could not save credentials: {}", e),
                    );
                }
                Err(ExtractionError::Sink(e.to_string()))
            }
        }
    }

    fn transition_if_current(
        &self,
        attempt_id: Uuid,
        state: ExtractionState,
        message: &str,
    ) -> bool {
        let mut inner = self.lock_inner();
        if inner.attempt_id != Some(attempt_id) {
            return false;
        }
        self.transition(&mut inner, state, message);
        true
    }

    fn clear_attempt(&self, attempt_id: Uuid) {
        let mut inner = self.lock_inner();
        if inner.attempt_id == Some(attempt_id) {
            inner.attempt_id = None;
        }
    }

    fn transition(&self, inner: &mut FlowInner, state: ExtractionState, message: &str) {
        let from = inner.state;
        inner.state = state;
        info!(from = %from, to = %state, "Extraction state changed");
        self.publish(state, message);
    }

    fn publish(&self, state: ExtractionState, message: &str) {
        let _ = self.status_tx.send(ExtractionStatus {
            state,
            message: message.to_string(),
        });
    }

    fn lock_inner(&self) -> MutexGuard<'_, FlowInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

use super::*;
use crate::credentials::SecretCodec;
use crate::usage::UsageWindow;
use chrono::TimeZone;
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use tempfile::TempDir;

/// Scripted fetcher: pops one response per call, falls back to a fixed
/// snapshot, and records which organization each call was made for.
struct FakeFetcher {
    calls: AtomicUsize,
    delay: Duration,
    responses: Mutex<VecDeque<Result<UsageSnapshot, UsageError>>>,
    seen_orgs: Mutex<Vec<Option<String>>>,
}

impl FakeFetcher {
    fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
            responses: Mutex::new(VecDeque::new()),
            seen_orgs: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, response: Result<UsageSnapshot, UsageError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UsageFetcher for FakeFetcher {
    async fn fetch(
        &self,
        credentials: Option<&CredentialRecord>,
    ) -> Result<UsageSnapshot, UsageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_orgs
            .lock()
            .unwrap()
            .push(credentials.map(|c| c.organization_id.clone()));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if credentials.is_none() {
            return Err(UsageError::NoCredentials);
        }

        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(snapshot(10.0, 5.0)))
    }
}

fn snapshot(five_hour: f64, seven_day: f64) -> UsageSnapshot {
    UsageSnapshot {
        five_hour: UsageWindow {
            utilization: five_hour,
            resets_at: None,
        },
        seven_day: UsageWindow {
            utilization: seven_day,
            resets_at: None,
        },
        fetched_at: Utc.with_ymd_and_hms(2025, 1, 15, 8, 0, 0).unwrap(),
    }
}

fn create_store(dir: &TempDir) -> Arc<CredentialStore> {
    Arc::new(CredentialStore::open(
        dir.path().join("credentials.enc"),
        SecretCodec::from_identifier("test-machine"),
    ))
}

fn create_controller(
    dir: &TempDir,
    fetcher: Arc<FakeFetcher>,
    signed_in: bool,
) -> Arc<PollingController> {
    let store = create_store(dir);
    if signed_in {
        store.set("sk-test", "org-1").unwrap();
    }
    Arc::new(PollingController::new(
        store,
        fetcher,
        PollingConfig::default(),
    ))
}

fn drain(rx: &mut broadcast::Receiver<PollingEvent>) -> Vec<PollingEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_refresh_updates_snapshot() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.push(Ok(snapshot(28.0, 9.0)));
    let controller = create_controller(&dir, Arc::clone(&fetcher), true);
    let mut rx = controller.subscribe();

    assert_eq!(controller.refresh().await, RefreshOutcome::Updated);

    let state = controller.state();
    assert_eq!(state.snapshot.five_hour.utilization, 28.0);
    assert!(state.last_updated.is_some());
    assert!(state.last_error.is_none());
    assert!(!state.is_loading);

    assert_eq!(
        drain(&mut rx),
        vec![
            PollingEvent::LoadingChanged(true),
            PollingEvent::SnapshotUpdated,
            PollingEvent::LoadingChanged(false),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_refreshes_collapse_into_one_fetch() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::with_delay(Duration::from_millis(50)));
    let controller = create_controller(&dir, Arc::clone(&fetcher), true);
    let mut rx = controller.subscribe();

    let (first, second) = tokio::join!(controller.refresh(), controller.refresh());

    assert_eq!(fetcher.calls(), 1);
    let mut outcomes = vec![first, second];
    outcomes.sort_by_key(|o| matches!(o, RefreshOutcome::Skipped));
    assert_eq!(outcomes, vec![RefreshOutcome::Updated, RefreshOutcome::Skipped]);

    let loading: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, PollingEvent::LoadingChanged(_)))
        .collect();
    assert_eq!(
        loading,
        vec![
            PollingEvent::LoadingChanged(true),
            PollingEvent::LoadingChanged(false),
        ]
    );
}

#[tokio::test]
async fn test_unauthorized_keeps_previous_snapshot() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.push(Ok(snapshot(40.0, 20.0)));
    fetcher.push(Err(UsageError::Unauthorized));
    let controller = create_controller(&dir, Arc::clone(&fetcher), true);

    controller.refresh().await;
    let before = controller.state();

    assert_eq!(
        controller.refresh().await,
        RefreshOutcome::Failed(UsageError::Unauthorized)
    );

    let after = controller.state();
    assert_eq!(after.snapshot, before.snapshot);
    assert_eq!(after.last_updated, before.last_updated);
    assert_eq!(after.last_error, Some(UsageError::Unauthorized));
    assert!(controller.needs_reauthentication());
}

#[tokio::test]
async fn test_transient_error_clears_on_next_success() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.push(Err(UsageError::Network("connection reset".to_string())));
    fetcher.push(Ok(snapshot(12.0, 3.0)));
    let controller = create_controller(&dir, Arc::clone(&fetcher), true);

    controller.refresh().await;
    let state = controller.state();
    assert!(state.last_error.as_ref().unwrap().is_transient());
    assert!(!controller.needs_reauthentication());
    assert!(state.snapshot.is_placeholder());

    controller.refresh().await;
    let state = controller.state();
    assert!(state.last_error.is_none());
    assert_eq!(state.snapshot.five_hour.utilization, 12.0);
}

#[tokio::test]
async fn test_refresh_without_credentials() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::new());
    let controller = create_controller(&dir, Arc::clone(&fetcher), false);

    assert_eq!(
        controller.refresh().await,
        RefreshOutcome::Failed(UsageError::NoCredentials)
    );
    assert_eq!(controller.indicator_text(DisplayMode::Both), "Setup");
    assert_eq!(fetcher.seen_orgs.lock().unwrap().as_slice(), &[None]);
}

#[tokio::test]
async fn test_over_limit_usage_is_accepted_and_clamped_for_display() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.push(Ok(snapshot(137.0, 9.0)));
    let controller = create_controller(&dir, Arc::clone(&fetcher), true);

    assert_eq!(controller.refresh().await, RefreshOutcome::Updated);
    assert_eq!(controller.state().snapshot.five_hour.utilization, 137.0);
    assert_eq!(
        controller.indicator_text(DisplayMode::Both),
        "5h 100% | W 9%"
    );
}

#[tokio::test]
async fn test_set_interval_clamps() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::new());
    let controller = create_controller(&dir, Arc::clone(&fetcher), true);
    let mut rx = controller.subscribe();

    assert_eq!(controller.set_interval(5), 30);
    assert_eq!(controller.interval_seconds(), 30);
    assert_eq!(controller.set_interval(9999), 600);
    assert_eq!(controller.interval_seconds(), 600);
    assert_eq!(controller.set_interval(120), 120);
    assert!(controller.is_auto_refreshing());

    let intervals: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, PollingEvent::IntervalChanged(_)))
        .collect();
    assert_eq!(
        intervals,
        vec![
            PollingEvent::IntervalChanged(30),
            PollingEvent::IntervalChanged(600),
            PollingEvent::IntervalChanged(120),
        ]
    );

    controller.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_start_auto_refresh_fetches_immediately() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::new());
    let controller = create_controller(&dir, Arc::clone(&fetcher), true);

    controller.start_auto_refresh();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fetcher.calls(), 1);
    assert!(controller.is_auto_refreshing());
    assert!(controller.state().last_updated.is_some());

    // Restarting replaces the timer and fetches once more, no duplicates
    controller.start_auto_refresh();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fetcher.calls(), 2);

    controller.stop_auto_refresh();
    assert!(!controller.is_auto_refreshing());
}

#[tokio::test(start_paused = true)]
async fn test_timer_refreshes_every_interval() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::new());
    let controller = create_controller(&dir, Arc::clone(&fetcher), true);
    assert_eq!(controller.interval_seconds(), 60);

    controller.start_auto_refresh();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(fetcher.calls(), 1);

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(fetcher.calls(), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fetcher.calls(), 2);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(fetcher.calls(), 3);

    controller.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_stop_lets_in_flight_fetch_complete() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::with_delay(Duration::from_millis(60)));
    fetcher.push(Ok(snapshot(33.0, 11.0)));
    let controller = create_controller(&dir, Arc::clone(&fetcher), true);

    controller.start_auto_refresh();
    tokio::time::sleep(Duration::from_millis(15)).await;
    assert!(controller.state().is_loading);

    controller.stop_auto_refresh();
    tokio::time::sleep(Duration::from_millis(120)).await;

    let state = controller.state();
    assert!(!state.is_loading);
    assert_eq!(state.snapshot.five_hour.utilization, 33.0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_discards_in_flight_result() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::with_delay(Duration::from_millis(50)));
    fetcher.push(Ok(snapshot(70.0, 50.0)));
    let controller = create_controller(&dir, Arc::clone(&fetcher), true);

    let in_flight = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.refresh().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    controller.shutdown();

    assert_eq!(in_flight.await.unwrap(), RefreshOutcome::Discarded);
    let state = controller.state();
    assert!(state.snapshot.is_placeholder());
    assert!(!state.is_loading);

    // Further refreshes are no-ops
    assert_eq!(controller.refresh().await, RefreshOutcome::Discarded);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sign_out_during_fetch_discards_result() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::with_delay(Duration::from_millis(50)));
    fetcher.push(Ok(snapshot(70.0, 50.0)));
    let controller = create_controller(&dir, Arc::clone(&fetcher), true);

    let in_flight = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.refresh().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(controller.state().is_loading);

    controller.clear_credentials().unwrap();

    assert_eq!(in_flight.await.unwrap(), RefreshOutcome::Discarded);
    let state = controller.state();
    assert!(state.snapshot.is_placeholder());
    assert_eq!(state.last_error, Some(UsageError::NoCredentials));
    assert!(state.last_updated.is_none());
    assert!(!state.is_loading);
    assert_eq!(controller.indicator_text(DisplayMode::Both), "Setup");
}

#[tokio::test(start_paused = true)]
async fn test_sign_in_during_fetch_refetches_with_new_credentials() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::with_delay(Duration::from_millis(50)));
    // The old session is rejected, the new one succeeds
    fetcher.push(Err(UsageError::Unauthorized));
    fetcher.push(Ok(snapshot(20.0, 4.0)));
    let controller = create_controller(&dir, Arc::clone(&fetcher), true);
    let mut rx = controller.subscribe();

    let in_flight = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.refresh().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    controller
        .save_credentials("sk-fresh", "org-fresh")
        .await
        .unwrap();

    assert_eq!(in_flight.await.unwrap(), RefreshOutcome::Discarded);
    assert_eq!(
        fetcher.seen_orgs.lock().unwrap().as_slice(),
        &[Some("org-1".to_string()), Some("org-fresh".to_string())]
    );

    let state = controller.state();
    assert!(state.last_error.is_none());
    assert!(!controller.needs_reauthentication());
    assert_eq!(state.snapshot.five_hour.utilization, 20.0);
    assert!(!drain(&mut rx)
        .iter()
        .any(|e| matches!(e, PollingEvent::FetchFailed(_))));
}

#[tokio::test(start_paused = true)]
async fn test_refresh_now_waits_for_running_fetch() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::with_delay(Duration::from_millis(20)));
    let controller = create_controller(&dir, Arc::clone(&fetcher), true);

    let (first, second) = tokio::join!(controller.refresh(), controller.refresh_now());

    assert_eq!(first, RefreshOutcome::Updated);
    assert_eq!(second, RefreshOutcome::Updated);
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn test_save_credentials_refreshes_with_new_record() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::new());
    let controller = create_controller(&dir, Arc::clone(&fetcher), false);

    controller
        .save_credentials(" sk-new ", " org-new ")
        .await
        .unwrap();

    assert!(controller.has_credentials());
    assert_eq!(
        fetcher.seen_orgs.lock().unwrap().as_slice(),
        &[Some("org-new".to_string())]
    );
    assert!(controller.state().last_updated.is_some());
}

#[tokio::test]
async fn test_save_credentials_rejects_blank_values() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::new());
    let controller = create_controller(&dir, Arc::clone(&fetcher), false);

    assert!(controller.save_credentials("sk", "  ").await.is_err());
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn test_clear_credentials_resets_display_state() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.push(Ok(snapshot(55.0, 22.0)));
    let controller = create_controller(&dir, Arc::clone(&fetcher), true);
    controller.refresh().await;
    let mut rx = controller.subscribe();

    controller.clear_credentials().unwrap();

    let state = controller.state();
    assert!(state.snapshot.is_placeholder());
    assert_eq!(state.last_error, Some(UsageError::NoCredentials));
    assert!(state.last_updated.is_none());
    assert!(!controller.has_credentials());
    assert_eq!(drain(&mut rx), vec![PollingEvent::CredentialsCleared]);

    // Idempotent
    controller.clear_credentials().unwrap();
}

#[tokio::test]
async fn test_credential_sink_delivery() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::new());
    let controller = create_controller(&dir, Arc::clone(&fetcher), false);

    let sink: Arc<dyn CredentialSink> = controller.clone();
    sink.deliver("sk-browser", "org-browser").await.unwrap();

    assert!(controller.has_credentials());
    assert_eq!(fetcher.calls(), 1);
}

//! Usage data model and response decoding.
//!
//! The provider reports two rolling windows, `five_hour` and `seven_day`,
//! each with a utilization percentage and an optional reset instant.
//! Raw utilization is kept exactly as fetched (it can exceed 100); clamping
//! happens only when a value is rendered, see [`display`].

pub mod client;
pub mod display;
pub mod timestamp;

pub use client::{Organization, UsageClient, UsageFetcher};

use crate::error::UsageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One rate-limit accounting window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageWindow {
    /// Percentage as reported, unclamped
    pub utilization: f64,

    /// `None` when the provider omitted it or sent an unrecognized format
    pub resets_at: Option<DateTime<Utc>>,
}

impl UsageWindow {
    /// Utilization clamped to `0..=100` for display.
    pub fn percent(&self) -> u8 {
        display::clamp_percent(self.utilization)
    }
}

/// Result of one successful fetch.
///
/// `Default` is the placeholder shown before the first fetch: both windows
/// at zero with no reset times.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub five_hour: UsageWindow,
    pub seven_day: UsageWindow,
    pub fetched_at: DateTime<Utc>,
}

impl UsageSnapshot {
    /// True for the placeholder snapshot.
    pub fn is_placeholder(&self) -> bool {
        *self == Self::default()
    }
}

/// Wire shape of the usage endpoint body.
#[derive(Debug, Deserialize)]
struct RawUsage {
    #[serde(default)]
    five_hour: Option<RawWindow>,
    #[serde(default)]
    seven_day: Option<RawWindow>,
}

#[derive(Debug, Deserialize)]
struct RawWindow {
    #[serde(default)]
    utilization: Option<f64>,
    #[serde(default)]
    resets_at: Option<String>,
}

impl From<RawWindow> for UsageWindow {
    fn from(raw: RawWindow) -> Self {
        Self {
            utilization: raw.utilization.unwrap_or(0.0),
            resets_at: raw
                .resets_at
                .as_deref()
                .and_then(timestamp::parse_reset_time),
        }
    }
}

/// Decodes a usage response body.
///
/// A window that is missing or `null` reads as zero usage. A body carrying
/// neither window is not a usage response and fails with `Decode`.
pub fn parse_usage_response(
    body: &[u8],
    fetched_at: DateTime<Utc>,
) -> Result<UsageSnapshot, UsageError> {
    let raw: RawUsage =
        serde_json::from_slice(body).map_err(|e| UsageError::Decode(e.to_string()))?;

    if raw.five_hour.is_none() && raw.seven_day.is_none() {
        return Err(UsageError::Decode(
            "response contains neither five_hour nor seven_day".to_string(),
        ));
    }

    Ok(UsageSnapshot {
        five_hour: raw.five_hour.map(UsageWindow::from).unwrap_or_default(),
        seven_day: raw.seven_day.map(UsageWindow::from).unwrap_or_default(),
        fetched_at,
    })
}

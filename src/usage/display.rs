//! Presentation helpers for the compact indicator.
//!
//! Everything here is pure: callers pass `now` explicitly so the output is
//! reproducible in tests.

use super::UsageSnapshot;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Which windows the indicator shows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    #[default]
    Both,
    FiveHour,
    SevenDay,
}

/// Severity bucket for a utilization percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageLevel {
    Normal,
    Elevated,
    Critical,
}

/// Clamps a raw utilization into `0..=100`. NaN reads as 0.
pub fn clamp_percent(raw: f64) -> u8 {
    if raw.is_nan() {
        return 0;
    }
    raw.clamp(0.0, 100.0) as u8
}

/// `<50` normal, `<80` elevated, otherwise critical.
pub fn usage_level(percent: u8) -> UsageLevel {
    match percent {
        0..=49 => UsageLevel::Normal,
        50..=79 => UsageLevel::Elevated,
        _ => UsageLevel::Critical,
    }
}

/// The 5-hour figure is emphasized when empty or at 90% and above.
pub fn is_five_hour_highlighted(percent: u8) -> bool {
    percent == 0 || percent >= 90
}

/// The 7-day figure is emphasized when empty or at 80% and above.
pub fn is_seven_day_highlighted(percent: u8) -> bool {
    percent == 0 || percent >= 80
}

/// Countdown text until `reset`.
///
/// `--` when unknown, `Now` once passed, otherwise `2d 3h`, `3h 12m` or `45m`.
pub fn format_time_until(reset: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(reset) = reset else {
        return "--".to_string();
    };
    if reset <= now {
        return "Now".to_string();
    }

    let total_minutes = (reset - now).num_minutes();
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;

    if hours >= 24 {
        format!("{}d {}h", hours / 24, hours % 24)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

/// Text shown in the persistent indicator.
///
/// `Setup` without credentials, `...` while the very first fetch is still
/// running, otherwise the percentages selected by `mode`.
pub fn indicator_text(
    has_credentials: bool,
    first_fetch_pending: bool,
    snapshot: &UsageSnapshot,
    mode: DisplayMode,
) -> String {
    if !has_credentials {
        return "Setup".to_string();
    }
    if first_fetch_pending {
        return "...".to_string();
    }

    let five_hour = format!("5h {}%", snapshot.five_hour.percent());
    let seven_day = format!("W {}%", snapshot.seven_day.percent());

    match mode {
        DisplayMode::Both => format!("{} | {}", five_hour, seven_day),
        DisplayMode::FiveHour => five_hour,
        DisplayMode::SevenDay => seven_day,
    }
}

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::error::TrackerError;

pub const DEFAULT_WINDOW_SECONDS: u64 = 60;
pub const DEFAULT_SCREENSHOTS_PER_WINDOW: u32 = 1;
pub const DEFAULT_IDLE_THRESHOLD_SECONDS: u32 = 480;
pub const DEFAULT_CAPTURE_PERIOD_SECONDS: u64 = 60;
pub const DEFAULT_REPORT_INTERVAL_SECONDS: u64 = 600;

/// How screenshot captures are scheduled. Exactly one policy is active for a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapturePolicy {
    /// One random offset per sub-interval of a window measured in elapsed tracker seconds.
    Windowed,
    /// A recurring wall timer fires every `period_seconds` and arms a single capture at a random
    /// delay inside that period.
    RandomDelay { period_seconds: u64 },
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self::Windowed
    }
}

/// What happens to idle time once the threshold has been crossed and the session resumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum IdleResolution {
    /// Idle time is dropped.
    #[default]
    Discard,
    /// Idle time is accumulated into the session's recorded idle total.
    Record,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub window_seconds: u64,
    pub screenshots_per_window: u32,
    pub idle_threshold_seconds: u32,
    pub capture_policy: CapturePolicy,
    pub report_interval_seconds: u64,
    pub idle_resolution: IdleResolution,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            window_seconds: DEFAULT_WINDOW_SECONDS,
            screenshots_per_window: DEFAULT_SCREENSHOTS_PER_WINDOW,
            idle_threshold_seconds: DEFAULT_IDLE_THRESHOLD_SECONDS,
            capture_policy: CapturePolicy::default(),
            report_interval_seconds: DEFAULT_REPORT_INTERVAL_SECONDS,
            idle_resolution: IdleResolution::default(),
        }
    }
}

impl TrackerConfig {
    /// Reads a JSON config. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {path:?}"))?;
        let config: TrackerConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {path:?}"))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.window_seconds == 0 {
            return Err(TrackerError::EmptyWindow);
        }
        if self.screenshots_per_window == 0 {
            return Err(TrackerError::NoSubIntervals);
        }
        if self.window_seconds % u64::from(self.screenshots_per_window) != 0 {
            return Err(TrackerError::UnevenWindow {
                window: self.window_seconds,
                intervals: self.screenshots_per_window,
            });
        }
        if self.idle_threshold_seconds == 0 {
            return Err(TrackerError::ZeroIdleThreshold);
        }
        if let CapturePolicy::RandomDelay { period_seconds: 0 } = self.capture_policy {
            return Err(TrackerError::ZeroCapturePeriod);
        }
        Ok(())
    }

    pub fn report_interval(&self) -> Option<Duration> {
        (self.report_interval_seconds > 0).then(|| Duration::from_secs(self.report_interval_seconds))
    }
}

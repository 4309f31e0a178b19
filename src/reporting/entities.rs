use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Activity accumulated since the previous report. One report is one line in a daily report
/// file.
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
pub struct ActivityReport {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub moment: DateTime<Utc>,
    /// Elapsed tracked time of the whole session when the report was made.
    pub session_elapsed_seconds: u64,
    pub tracked_seconds: u64,
    pub idle_seconds: u64,
    pub key_events: u64,
    pub mouse_events: u64,
    pub mouse_motion: u64,
    /// Screenshot taken since the previous report, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<PathBuf>,
}

/// Totals over a set of reports.
#[derive(PartialEq, Eq, Debug, Default, Clone)]
pub struct ActivitySummary {
    pub reports: usize,
    pub tracked_seconds: u64,
    pub key_events: u64,
    pub mouse_events: u64,
    pub mouse_motion: u64,
    pub screenshots: usize,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

impl ActivitySummary {
    pub fn add(&mut self, report: &ActivityReport) {
        self.reports += 1;
        self.tracked_seconds += report.tracked_seconds;
        self.key_events += report.key_events;
        self.mouse_events += report.mouse_events;
        self.mouse_motion += report.mouse_motion;
        if report.screenshot.is_some() {
            self.screenshots += 1;
        }
        self.first = Some(self.first.map_or(report.moment, |v| v.min(report.moment)));
        self.last = Some(self.last.map_or(report.moment, |v| v.max(report.moment)));
    }
}

impl<'a> FromIterator<&'a ActivityReport> for ActivitySummary {
    fn from_iter<T: IntoIterator<Item = &'a ActivityReport>>(iter: T) -> Self {
        let mut summary = ActivitySummary::default();
        for report in iter {
            summary.add(report);
        }
        summary
    }
}

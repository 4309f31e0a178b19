use std::{path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use futures::{future, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use super::config::DEFAULT_IDLE_THRESHOLD_SECONDS;

/// Handle to a captured screenshot stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Screenshot {
    pub path: PathBuf,
    pub taken_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
}

/// A single input event reported by an [InputListener](super::input::InputListener).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputActivity {
    Key,
    MouseButton,
    MouseMotion,
    /// Some input happened, seen only through the operating system's idle counter. Resets idle
    /// time without counting a device event.
    System,
}

/// Everything the presentation layer can observe about a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub elapsed_seconds: u64,
    pub idle_seconds: u64,
    pub is_running: bool,
    pub is_idle_clock_running: bool,
    pub key_event_count: u64,
    pub mouse_event_count: u64,
    pub mouse_motion_count: u64,
    pub idle_threshold_seconds: u32,
    pub last_screenshot: Option<Arc<Screenshot>>,
    pub last_screenshot_age_seconds: u64,
    /// Whole minutes of tracked time since the last screenshot, bumped on minute boundaries of
    /// `elapsed_seconds`.
    pub minutes_since_screenshot: u64,
    pub captures_paused: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            elapsed_seconds: 0,
            idle_seconds: 0,
            is_running: false,
            is_idle_clock_running: false,
            key_event_count: 0,
            mouse_event_count: 0,
            mouse_motion_count: 0,
            idle_threshold_seconds: DEFAULT_IDLE_THRESHOLD_SECONDS,
            last_screenshot: None,
            last_screenshot_age_seconds: 0,
            minutes_since_screenshot: 0,
            captures_paused: false,
        }
    }
}

impl SessionState {
    pub fn idle_threshold_exceeded(&self) -> bool {
        self.idle_seconds > u64::from(self.idle_threshold_seconds)
    }
}

/// Streams a single field of the session, emitting only when that field changes.
pub fn watch_field<T, F>(
    receiver: watch::Receiver<SessionState>,
    select: F,
) -> impl Stream<Item = T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: Fn(&SessionState) -> T + Send + 'static,
{
    let mut last: Option<T> = None;
    WatchStream::new(receiver)
        .map(move |state| select(&state))
        .filter(move |value| {
            let changed = last.as_ref() != Some(value);
            if changed {
                last = Some(value.clone());
            }
            future::ready(changed)
        })
}

//! Work session tracker. A [tracker::SessionTracker] counts elapsed and idle time, keyboard and
//! mouse activity and takes screenshots at random moments of every window, the
//! [tracker::module::TrackerModule] drives it once a second and emits activity reports that
//! [reporting] stores on disk.
//!

pub mod cli;
pub mod platform;
pub mod reporting;
pub mod tracker;
pub mod utils;

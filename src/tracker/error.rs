use thiserror::Error;

/// Configuration mistakes detected by the tracker. These indicate a programming or config error
/// rather than a runtime condition, so they are reported as soon as a schedule is computed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("Screenshot window must contain at least one sub-interval")]
    NoSubIntervals,

    #[error("Screenshot window must be longer than zero seconds")]
    EmptyWindow,

    #[error("Window length ({window}) must be evenly divisible by {intervals}")]
    UnevenWindow { window: u64, intervals: u32 },

    #[error("Idle threshold must be greater than zero seconds")]
    ZeroIdleThreshold,

    #[error("Random delay period must be greater than zero seconds")]
    ZeroCapturePeriod,
}

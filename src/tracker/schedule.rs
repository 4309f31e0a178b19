use std::ops::Range;

use rand::Rng;

use super::error::TrackerError;

/// Randomized capture offsets for one window of elapsed tracker time.
///
/// The window `[start, end)` is split into equal sub-intervals and one offset is drawn uniformly
/// from each of them, so offsets are sorted and strictly inside the window. Offsets are consumed
/// front to back by [ScreenshotSchedule::poll].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenshotSchedule {
    window: Range<u64>,
    offsets: Vec<u64>,
    next: usize,
}

impl ScreenshotSchedule {
    pub fn generate(
        rng: &mut impl Rng,
        window_start: u64,
        window_length: u64,
        intervals: u32,
    ) -> Result<Self, TrackerError> {
        if intervals == 0 {
            return Err(TrackerError::NoSubIntervals);
        }
        if window_length == 0 {
            return Err(TrackerError::EmptyWindow);
        }
        if window_length % u64::from(intervals) != 0 {
            return Err(TrackerError::UnevenWindow {
                window: window_length,
                intervals,
            });
        }

        let interval_size = window_length / u64::from(intervals);
        let offsets = (0..u64::from(intervals))
            .map(|i| {
                let start = window_start + i * interval_size;
                rng.gen_range(start..start + interval_size)
            })
            .collect();

        Ok(Self {
            window: window_start..window_start + window_length,
            offsets,
            next: 0,
        })
    }

    pub fn window(&self) -> Range<u64> {
        self.window.clone()
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub fn next_offset(&self) -> Option<u64> {
        self.offsets.get(self.next).copied()
    }

    pub fn is_exhausted(&self) -> bool {
        self.next >= self.offsets.len()
    }

    /// Consumes the next offset when `elapsed` has reached it. At most one offset is consumed per
    /// call.
    pub fn poll(&mut self, elapsed: u64) -> bool {
        match self.next_offset() {
            Some(offset) if elapsed >= offset => {
                self.next += 1;
                true
            }
            _ => false,
        }
    }
}

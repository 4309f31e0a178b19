//! Cancelable recurring and one-shot timers. Callbacks run on the current runtime, every
//! invocation is isolated so that an error or a panic inside one of them is logged and the
//! schedule keeps going.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    time::Duration,
};

use anyhow::Result;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

/// Handle to a scheduled timer. Dropping the handle cancels the timer.
pub struct ScheduledTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Runs `callback` once, converting both errors and panics into log records.
/// Returns `true` when the callback completed successfully.
pub fn run_isolated<F>(name: &str, callback: F) -> bool
where
    F: FnOnce() -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("Timer callback {name} failed {e:?}");
            false
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|v| v.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            error!("Timer callback {name} panicked: {message}");
            false
        }
    }
}

/// Calls `callback` after `first_delay` and then every `period` until the returned task or
/// `parent` is cancelled. Deadlines are fixed-rate, a slow callback does not shift later ticks.
pub fn schedule_recurring<F>(
    parent: &CancellationToken,
    first_delay: Duration,
    period: Duration,
    mut callback: F,
) -> ScheduledTask
where
    F: FnMut() -> Result<()> + Send + 'static,
{
    let token = parent.child_token();
    let task_token = token.clone();
    let handle = tokio::spawn(async move {
        let mut deadline = Instant::now() + first_delay;
        loop {
            tokio::select! {
                _ = task_token.cancelled() => {
                    trace!("Recurring task cancelled");
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => ()
            }
            deadline += period;
            run_isolated("recurring", &mut callback);
        }
    });
    ScheduledTask { token, handle }
}

/// Calls `callback` once after `delay` unless cancelled first.
pub fn schedule_once<F>(parent: &CancellationToken, delay: Duration, callback: F) -> ScheduledTask
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let token = parent.child_token();
    let task_token = token.clone();
    let handle = tokio::spawn(async move {
        tokio::select! {
            _ = task_token.cancelled() => {
                trace!("One-shot task cancelled");
            }
            _ = tokio::time::sleep(delay) => {
                run_isolated("once", callback);
            }
        }
    });
    ScheduledTask { token, handle }
}

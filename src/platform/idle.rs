use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::{
    tracker::{input::InputListener, state::InputActivity},
    utils::scheduler::{schedule_recurring, ScheduledTask},
};

pub const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Time since the last keyboard or mouse input, as the operating system counts it.
#[cfg_attr(test, mockall::automock)]
pub trait IdleTimeSource: Send {
    fn idle_time(&mut self) -> Result<Duration>;
}

/// Serves as a cross-compatible IdleTimeSource implementation.
pub struct GenericIdleTimeSource {
    inner: Box<dyn IdleTimeSource>,
}

impl GenericIdleTimeSource {
    pub fn new() -> Result<Self> {
        cfg_if::cfg_if! {
            if #[cfg(feature = "win")] {
                use super::win::WindowsIdleTimeSource;
                Ok(Self {
                    inner: Box::new(WindowsIdleTimeSource),
                })
            }
            else if #[cfg(feature = "x11")] {
                use super::x11::LinuxIdleTimeSource;
                Ok(Self {
                    inner: Box::new(LinuxIdleTimeSource::new()?),
                })
            }
            else {
                Err(anyhow!("No idle time backend was compiled in"))
            }
        }
    }
}

impl IdleTimeSource for GenericIdleTimeSource {
    fn idle_time(&mut self) -> Result<Duration> {
        self.inner.idle_time()
    }
}

/// [InputListener] backed by the system idle counter. While registered it polls the source
/// every `poll_interval`; an idle time shorter than the interval means input arrived since the
/// previous poll, and one [InputActivity::System] is forwarded.
pub struct IdlePollingListener {
    source: Arc<Mutex<Box<dyn IdleTimeSource>>>,
    poll_interval: Duration,
    polling: Option<ScheduledTask>,
}

impl IdlePollingListener {
    pub fn new(source: impl IdleTimeSource + 'static, poll_interval: Duration) -> Self {
        Self {
            source: Arc::new(Mutex::new(Box::new(source))),
            poll_interval,
            polling: None,
        }
    }
}

impl InputListener for IdlePollingListener {
    fn register(&mut self, sink: mpsc::Sender<InputActivity>) -> Result<()> {
        let source = self.source.clone();
        let poll_interval = self.poll_interval;
        self.polling = Some(schedule_recurring(
            &CancellationToken::new(),
            poll_interval,
            poll_interval,
            move || {
                let idle = source
                    .lock()
                    .map_err(|_| anyhow!("Idle time source is poisoned"))?
                    .idle_time()?;
                if idle >= poll_interval {
                    return Ok(());
                }
                trace!("System input {idle:?} ago");
                match sink.try_send(InputActivity::System) {
                    Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
                    Err(TrySendError::Closed(_)) => Err(anyhow!("Tracker stopped listening")),
                }
            },
        ));
        Ok(())
    }

    fn unregister(&mut self) {
        self.polling.take();
    }
}

/// Listener for the compiled in idle backend, or `None` when there is no way to observe input.
pub fn create_input_listener() -> Option<Box<dyn InputListener>> {
    match GenericIdleTimeSource::new() {
        Ok(source) => Some(Box::new(IdlePollingListener::new(source, IDLE_POLL_INTERVAL))),
        Err(e) => {
            warn!("Input activity is not observable: {e:?}");
            None
        }
    }
}

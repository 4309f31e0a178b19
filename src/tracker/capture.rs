use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, info_span, warn, Instrument};

use super::state::{Screenshot, SessionState};

/// Platform independent contract for taking a screenshot. Failing to capture, for example
/// because a permission was not granted, is reported as an error and treated as "no image".
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScreenshotProvider: Send + Sync + 'static {
    async fn capture(&self) -> Result<Screenshot>;
}

/// Provider used when no capture backend is available. Every capture is skipped.
pub struct UnavailableScreenshotProvider;

#[async_trait]
impl ScreenshotProvider for UnavailableScreenshotProvider {
    async fn capture(&self) -> Result<Screenshot> {
        Err(anyhow::anyhow!("Screen capture is not available on this platform"))
    }
}

/// Launches captures without blocking the caller and writes results back into the observed
/// state. Clones share the provider, the state and the set of in-flight captures.
#[derive(Clone)]
pub struct CaptureDispatcher {
    provider: Arc<dyn ScreenshotProvider>,
    state: Arc<watch::Sender<SessionState>>,
    in_flight: TaskTracker,
}

impl CaptureDispatcher {
    pub fn new(provider: Arc<dyn ScreenshotProvider>, state: Arc<watch::Sender<SessionState>>) -> Self {
        Self {
            provider,
            state,
            in_flight: TaskTracker::new(),
        }
    }

    /// Spawns a capture that is abandoned as soon as `cancel` fires. Returns `false` when
    /// captures are paused and nothing was spawned.
    pub fn request(&self, cancel: &CancellationToken) -> bool {
        if self.state.borrow().captures_paused {
            debug!("Captures are paused, skipping screenshot");
            return false;
        }

        let provider = self.provider.clone();
        let state = self.state.clone();
        let cancel = cancel.clone();
        let span = info_span!("Capturing screenshot");
        self.in_flight.spawn(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Screenshot capture cancelled");
                    }
                    result = provider.capture() => match result {
                        Ok(screenshot) => {
                            info!("Captured screenshot {:?}", screenshot.path);
                            state.send_modify(|s| {
                                s.last_screenshot = Some(Arc::new(screenshot));
                                s.last_screenshot_age_seconds = 0;
                                s.minutes_since_screenshot = 0;
                            });
                        }
                        Err(e) => {
                            warn!("Screenshot capture skipped {e:?}");
                        }
                    }
                }
            }
            .instrument(span),
        );
        true
    }

    /// Waits for every capture spawned so far to finish or be cancelled.
    pub async fn settle(&self) {
        self.in_flight.close();
        self.in_flight.wait().await;
        self.in_flight.reopen();
    }
}

use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    reporting::entities::ActivityReport,
    utils::{clock::Clock, scheduler::run_isolated},
};

use super::{
    state::{InputActivity, SessionState},
    SessionTracker, TickOutcome,
};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
const COMMAND_BUFFER: usize = 32;

/// Operations the presentation layer can ask of a running tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerCommand {
    Start,
    Stop,
    Resume,
    Reset,
    ResetIdleClock,
    StartIdleClock,
    StopIdleClock,
    AdjustForIdlePeriod(u64),
    SetIdleThreshold(u32),
    RequestScreenshot,
    PauseCaptures,
    ResumeCaptures,
}

/// Cloneable access to a tracker owned by a [TrackerModule].
#[derive(Clone)]
pub struct TrackerHandle {
    commands: mpsc::Sender<TrackerCommand>,
    state: watch::Receiver<SessionState>,
}

impl TrackerHandle {
    pub async fn send(&self, command: TrackerCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|e| anyhow!("Tracker is no longer running, dropped {:?}", e.0))
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }
}

/// Differences between the current state and what was last reported.
struct ReportEmitter {
    next: mpsc::Sender<ActivityReport>,
    every_ticks: u64,
    ticks_since_report: u64,
    /// Seconds tracked since the last report. Counted per running tick, so a reset does not
    /// erase them. Idle adjustments are subtracted and may leave a debt for the next report.
    tracked_seconds: i64,
    reported: SessionState,
}

impl ReportEmitter {
    fn build(&mut self, state: &SessionState, moment: chrono::DateTime<chrono::Utc>) -> ActivityReport {
        let screenshot = match (&state.last_screenshot, &self.reported.last_screenshot) {
            (Some(current), Some(previous)) if current == previous => None,
            (Some(current), _) => Some(current.path.clone()),
            (None, _) => None,
        };
        let report = ActivityReport {
            moment,
            session_elapsed_seconds: state.elapsed_seconds,
            tracked_seconds: self.tracked_seconds.max(0) as u64,
            idle_seconds: state.idle_seconds,
            key_events: state
                .key_event_count
                .saturating_sub(self.reported.key_event_count),
            mouse_events: state
                .mouse_event_count
                .saturating_sub(self.reported.mouse_event_count),
            mouse_motion: state
                .mouse_motion_count
                .saturating_sub(self.reported.mouse_motion_count),
            screenshot,
        };
        self.reported = state.clone();
        self.ticks_since_report = 0;
        self.tracked_seconds = self.tracked_seconds.min(0);
        report
    }
}

/// Owns a [SessionTracker] and is the only place that mutates it. Ticks, commands and input
/// events are handled one at a time on the module's task.
pub struct TrackerModule {
    tracker: SessionTracker,
    commands: mpsc::Receiver<TrackerCommand>,
    input_events: mpsc::Receiver<InputActivity>,
    shutdown: CancellationToken,
    tick_interval: Duration,
    time_provider: Box<dyn Clock>,
    reports: Option<ReportEmitter>,
}

impl TrackerModule {
    pub fn new(
        mut tracker: SessionTracker,
        shutdown: CancellationToken,
        tick_interval: Duration,
        time_provider: Box<dyn Clock>,
    ) -> Result<(Self, TrackerHandle)> {
        let input_events = tracker
            .take_input_events()
            .ok_or_else(|| anyhow!("Tracker input events are already consumed"))?;
        let (sender, commands) = mpsc::channel(COMMAND_BUFFER);
        let handle = TrackerHandle {
            commands: sender,
            state: tracker.subscribe(),
        };
        Ok((
            Self {
                tracker,
                commands,
                input_events,
                shutdown,
                tick_interval,
                time_provider,
                reports: None,
            },
            handle,
        ))
    }

    /// Emits an [ActivityReport] after every `every` of tracked time and once more on shutdown.
    pub fn with_reports(mut self, next: mpsc::Sender<ActivityReport>, every: Duration) -> Self {
        let every_ticks = (every.as_millis() / self.tick_interval.as_millis().max(1)).max(1) as u64;
        self.reports = Some(ReportEmitter {
            next,
            every_ticks,
            ticks_since_report: 0,
            tracked_seconds: 0,
            reported: self.tracker.state(),
        });
        self
    }

    /// Executes the tracker event loop until shutdown.
    pub async fn run(mut self) -> Result<()> {
        let mut tick_point = self.time_provider.instant() + self.tick_interval;
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    break;
                }
                _ = self.time_provider.sleep_until(tick_point) => {
                    tick_point += self.tick_interval;
                    self.tick();
                }
                Some(command) = self.commands.recv() => {
                    self.apply(command);
                }
                Some(activity) = self.input_events.recv() => {
                    trace!("Input activity {activity:?}");
                    self.tracker.record_activity(activity);
                }
            }
        }

        info!("Shutting down tracker");
        self.tracker.stop();
        if self
            .reports
            .as_ref()
            .is_some_and(|reports| reports.ticks_since_report > 0)
        {
            self.emit_report();
        }
        Ok(())
    }

    fn tick(&mut self) {
        let mut outcome = TickOutcome::Stopped;
        let tracker = &mut self.tracker;
        run_isolated("tracker tick", || {
            outcome = tracker.on_tick();
            if tracker.idle_clock_armed() {
                tracker.on_idle_tick();
            }
            Ok(())
        });

        if outcome == TickOutcome::CaptureRequested {
            debug!("Screenshot requested at {}s", self.tracker.state().elapsed_seconds);
        }
        if outcome == TickOutcome::Stopped {
            return;
        }

        let due = match self.reports.as_mut() {
            Some(reports) => {
                reports.ticks_since_report += 1;
                reports.tracked_seconds += 1;
                reports.ticks_since_report >= reports.every_ticks
            }
            None => false,
        };
        if due {
            self.emit_report();
        }
    }

    fn emit_report(&mut self) {
        let state = self.tracker.state();
        let moment = self.time_provider.time();
        let Some(reports) = self.reports.as_mut() else {
            return;
        };
        let report = reports.build(&state, moment);
        // The tick loop never waits on the reporting side.
        match reports.next.try_send(report) {
            Ok(()) => debug!("Activity report queued"),
            Err(TrySendError::Full(report)) => {
                warn!("Reporting is lagging behind, dropped report {report:?}")
            }
            Err(TrySendError::Closed(_)) => error!("Reporting module is gone"),
        }
    }

    fn apply(&mut self, command: TrackerCommand) {
        debug!("Applying {command:?}");
        let tracker = &mut self.tracker;
        let result = match command {
            TrackerCommand::Start => tracker.start(),
            TrackerCommand::Resume => tracker.resume(),
            TrackerCommand::SetIdleThreshold(seconds) => tracker.set_idle_threshold(seconds),
            TrackerCommand::Stop => {
                tracker.stop();
                Ok(())
            }
            TrackerCommand::Reset => {
                tracker.reset();
                Ok(())
            }
            TrackerCommand::ResetIdleClock => {
                tracker.reset_idle_clock();
                Ok(())
            }
            TrackerCommand::StartIdleClock => {
                tracker.start_idle_clock();
                Ok(())
            }
            TrackerCommand::StopIdleClock => {
                tracker.stop_idle_clock();
                Ok(())
            }
            TrackerCommand::AdjustForIdlePeriod(offset) => {
                let before = tracker.state().elapsed_seconds;
                tracker.adjust_for_idle_period(offset);
                let removed = before - tracker.state().elapsed_seconds;
                if let Some(reports) = self.reports.as_mut() {
                    reports.tracked_seconds -= removed as i64;
                }
                Ok(())
            }
            TrackerCommand::RequestScreenshot => {
                tracker.request_screenshot();
                Ok(())
            }
            TrackerCommand::PauseCaptures => {
                tracker.pause_captures();
                Ok(())
            }
            TrackerCommand::ResumeCaptures => {
                tracker.resume_captures();
                Ok(())
            }
        };
        if let Err(e) = result {
            error!("Tracker rejected command {e}");
        }
    }
}

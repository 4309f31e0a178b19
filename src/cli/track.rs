use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::{CommandFactory, Parser, ValueEnum};
use futures::StreamExt;
use tokio::{select, sync::mpsc};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    platform::{create_screenshot_provider, idle::create_input_listener},
    reporting::{
        entities::ActivityReport, local_save::LocalReportSaver, storage::ReportStorageImpl,
        ReportingModule,
    },
    tracker::{
        capture::ScreenshotProvider,
        config::{CapturePolicy, IdleResolution, TrackerConfig, DEFAULT_CAPTURE_PERIOD_SECONDS},
        input::{InputListener, NoInputListener},
        module::{TrackerCommand, TrackerHandle, TrackerModule, DEFAULT_TICK_INTERVAL},
        SessionTracker,
    },
    utils::{
        clock::{Clock, SystemClock},
        time::format_hms,
    },
};

use super::Args;

const REPORT_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyKind {
    Windowed,
    RandomDelay,
}

#[derive(Debug, Parser)]
pub struct TrackCommand {
    #[arg(long, help = "JSON file with tracker settings. Flags override its values")]
    config: Option<PathBuf>,
    #[arg(long, help = "Length of a screenshot window in seconds")]
    window_seconds: Option<u64>,
    #[arg(long, help = "Screenshots taken in every window")]
    screenshots_per_window: Option<u32>,
    #[arg(long, help = "Seconds without input before the session counts as idle")]
    idle_threshold: Option<u32>,
    #[arg(long, value_enum, help = "How screenshot times are picked")]
    policy: Option<PolicyKind>,
    #[arg(long, help = "Period of the random-delay policy in seconds")]
    period: Option<u64>,
    #[arg(long, value_enum, help = "Whether idle time is kept once the session resumes")]
    idle_resolution: Option<IdleResolution>,
    #[arg(long, help = "Seconds of tracked time between reports. 0 disables reports")]
    report_interval: Option<u64>,
}

impl TrackCommand {
    fn into_config(self) -> Result<TrackerConfig> {
        let mut config = match &self.config {
            Some(path) => TrackerConfig::load(path)?,
            None => TrackerConfig::default(),
        };

        if let Some(v) = self.window_seconds {
            config.window_seconds = v;
        }
        if let Some(v) = self.screenshots_per_window {
            config.screenshots_per_window = v;
        }
        if let Some(v) = self.idle_threshold {
            config.idle_threshold_seconds = v;
        }
        if let Some(v) = self.idle_resolution {
            config.idle_resolution = v;
        }
        if let Some(v) = self.report_interval {
            config.report_interval_seconds = v;
        }

        config.capture_policy = match (self.policy, self.period, config.capture_policy) {
            (Some(PolicyKind::Windowed), None, _) => CapturePolicy::Windowed,
            (Some(PolicyKind::RandomDelay), period, current) => CapturePolicy::RandomDelay {
                period_seconds: period.unwrap_or(match current {
                    CapturePolicy::RandomDelay { period_seconds } => period_seconds,
                    CapturePolicy::Windowed => DEFAULT_CAPTURE_PERIOD_SECONDS,
                }),
            },
            (None, Some(period), CapturePolicy::RandomDelay { .. }) => {
                CapturePolicy::RandomDelay {
                    period_seconds: period,
                }
            }
            (_, Some(_), _) => {
                return Err(Args::command()
                    .error(
                        clap::error::ErrorKind::ArgumentConflict,
                        "--period only applies to the random-delay policy",
                    )
                    .into());
            }
            (None, None, current) => current,
        };

        config.validate()?;
        Ok(config)
    }
}

/// Runs a tracking session until ctrl-c. Reports go to `<dir>/reports`, screenshots to
/// `<dir>/screenshots`.
pub async fn process_track_command(command: TrackCommand, dir: PathBuf) -> Result<()> {
    let config = command.into_config()?;
    info!("Tracking with {config:?}");

    let shutdown_token = CancellationToken::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let provider = create_screenshot_provider(dir.join("screenshots"), clock);
    let Tracking {
        module,
        handle,
        watcher,
    } = create_tracking(
        &config,
        provider,
        create_input_listener(),
        &shutdown_token,
        SystemClock,
    )?;

    let (sender, receiver) = mpsc::channel::<ActivityReport>(REPORT_BUFFER);
    let module = match config.report_interval() {
        Some(every) => module.with_reports(sender, every),
        None => {
            drop(sender);
            module
        }
    };
    let reporting = create_reporting(dir.join("reports"), receiver)?;

    handle.send(TrackerCommand::Start).await?;

    let (_, tracking_result, reporting_result, watcher_result) = tokio::join!(
        detect_shutdown(shutdown_token.clone()),
        module.run(),
        reporting.run(),
        run_watcher(watcher),
    );

    if let Err(tracking_result) = tracking_result {
        error!("Tracker module got an error {:?}", tracking_result);
    }

    if let Err(reporting_result) = reporting_result {
        error!("Reporting module got an error {:?}", reporting_result);
    }

    let state = handle.snapshot();
    println!(
        "Tracked {} in this session, {} recorded idle",
        format_hms(state.elapsed_seconds),
        format_hms(watcher_result?)
    );
    Ok(())
}

/// Tracker driver plus the idle watcher that belongs to it.
struct Tracking {
    module: TrackerModule,
    handle: TrackerHandle,
    watcher: Option<IdleWatcher>,
}

/// Without an input source idle time only ever grows, so no watcher is created and idle periods
/// are never taken off tracked time.
fn create_tracking(
    config: &TrackerConfig,
    provider: Arc<dyn ScreenshotProvider>,
    input: Option<Box<dyn InputListener>>,
    shutdown_token: &CancellationToken,
    clock: impl Clock,
) -> Result<Tracking> {
    let watch_idle = input.is_some();
    if !watch_idle {
        warn!("Idle periods will not be detected");
    }
    let tracker = SessionTracker::new(
        config.clone(),
        provider,
        input.unwrap_or_else(|| Box::new(NoInputListener)),
        shutdown_token.clone(),
    )?;
    let (module, handle) = TrackerModule::new(
        tracker,
        shutdown_token.clone(),
        DEFAULT_TICK_INTERVAL,
        Box::new(clock),
    )?;
    let watcher = watch_idle.then(|| {
        IdleWatcher::new(
            handle.clone(),
            config.idle_resolution,
            shutdown_token.clone(),
        )
    });

    Ok(Tracking {
        module,
        handle,
        watcher,
    })
}

async fn run_watcher(watcher: Option<IdleWatcher>) -> Result<u64> {
    match watcher {
        Some(watcher) => watcher.run().await,
        None => Ok(0),
    }
}

fn create_reporting(
    report_dir: PathBuf,
    receiver: mpsc::Receiver<ActivityReport>,
) -> Result<ReportingModule<LocalReportSaver<ReportStorageImpl>>> {
    let storage = ReportStorageImpl::new(report_dir)?;
    let saver = LocalReportSaver::new(storage);
    Ok(ReportingModule::new(receiver, saver))
}

/// Cancels `cancelation` on ctrl-c. Returns early if something else cancelled it first.
async fn detect_shutdown(cancelation: CancellationToken) {
    select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for ctrl-c {e:?}");
            }
            info!("Shutdown requested");
            cancelation.cancel();
        },
        _ = cancelation.cancelled() => {},
    };
}

/// Console counterpart of the idle dialog. Once a running session has been idle longer than the
/// threshold the tracker is stopped, the threshold is taken back off the elapsed time, the idle
/// clock is reset and the session resumes. With [IdleResolution::Record] the idle time is added
/// to the recorded total first.
pub struct IdleWatcher {
    handle: TrackerHandle,
    resolution: IdleResolution,
    shutdown: CancellationToken,
    recorded_idle_seconds: u64,
}

impl IdleWatcher {
    pub fn new(handle: TrackerHandle, resolution: IdleResolution, shutdown: CancellationToken) -> Self {
        Self {
            handle,
            resolution,
            shutdown,
            recorded_idle_seconds: 0,
        }
    }

    /// Watches the tracker until shutdown and returns the recorded idle seconds.
    pub async fn run(mut self) -> Result<u64> {
        let mut states = WatchStream::new(self.handle.subscribe());
        let mut reported_minutes = 0;
        // Set between resolving an idle period and seeing the reset idle clock.
        let mut resolving = false;

        loop {
            let state = select! {
                _ = self.shutdown.cancelled() => break,
                state = states.next() => match state {
                    Some(state) => state,
                    None => break,
                },
            };

            let minutes = state.elapsed_seconds / 60;
            if minutes > reported_minutes {
                info!(
                    "Tracked {}, idle {}s, {} keys, {} clicks, {} moves, last screenshot {}s ago",
                    format_hms(state.elapsed_seconds),
                    state.idle_seconds,
                    state.key_event_count,
                    state.mouse_event_count,
                    state.mouse_motion_count,
                    state.last_screenshot_age_seconds,
                );
            }
            reported_minutes = minutes;

            if !state.idle_threshold_exceeded() {
                resolving = false;
                continue;
            }
            if resolving || !state.is_running {
                continue;
            }

            resolving = true;
            warn!(
                "Idle for {}s, over the {}s threshold",
                state.idle_seconds, state.idle_threshold_seconds
            );
            self.handle.send(TrackerCommand::Stop).await?;
            self.handle
                .send(TrackerCommand::AdjustForIdlePeriod(u64::from(
                    state.idle_threshold_seconds,
                )))
                .await?;
            if self.resolution == IdleResolution::Record {
                self.recorded_idle_seconds += state.idle_seconds;
            }
            self.handle.send(TrackerCommand::ResetIdleClock).await?;
            self.handle.send(TrackerCommand::Resume).await?;
        }

        info!("Recorded idle time {}", format_hms(self.recorded_idle_seconds));
        Ok(self.recorded_idle_seconds)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use anyhow::Result;
    use chrono::{TimeZone, Utc};
    use clap::Parser;
    use tokio_util::sync::CancellationToken;

    use crate::{
        platform::idle::{IdlePollingListener, IdleTimeSource, IDLE_POLL_INTERVAL},
        tracker::{
            capture::UnavailableScreenshotProvider,
            config::{CapturePolicy, IdleResolution, TrackerConfig},
            input::{InputListener, NoInputListener},
            module::TrackerCommand,
            state::SessionState,
        },
        utils::{clock::OffsetClock, logging::TEST_LOGGING},
    };

    use super::{create_tracking, run_watcher, TrackCommand, Tracking};

    fn parse(args: &[&str]) -> Result<TrackerConfig> {
        TrackCommand::try_parse_from(std::iter::once("track").chain(args.iter().copied()))?
            .into_config()
    }

    #[test]
    fn flags_override_defaults() -> Result<()> {
        let config = parse(&[
            "--window-seconds",
            "600",
            "--screenshots-per-window",
            "3",
            "--policy",
            "random-delay",
            "--idle-resolution",
            "record",
        ])?;
        assert_eq!(config.window_seconds, 600);
        assert_eq!(config.screenshots_per_window, 3);
        assert_eq!(
            config.capture_policy,
            CapturePolicy::RandomDelay { period_seconds: 60 }
        );
        assert_eq!(config.idle_resolution, IdleResolution::Record);
        assert_eq!(parse(&[])?, TrackerConfig::default());
        Ok(())
    }

    #[test]
    fn rejects_invalid_combinations() {
        assert!(parse(&["--period", "30"]).is_err());
        assert!(parse(&["--policy", "windowed", "--period", "30"]).is_err());
        assert!(parse(&["--window-seconds", "60", "--screenshots-per-window", "7"]).is_err());
        assert!(parse(&["--idle-threshold", "0"]).is_err());
    }

    /// Idle source of a user who is typing the whole time.
    struct ActiveUser;

    impl IdleTimeSource for ActiveUser {
        fn idle_time(&mut self) -> Result<Duration> {
            Ok(Duration::from_millis(200))
        }
    }

    /// Runs a session wired like the `track` command for `run_for` of paused time.
    async fn run_session(
        config: TrackerConfig,
        input: Option<Box<dyn InputListener>>,
        run_for: Duration,
    ) -> Result<(SessionState, u64)> {
        let shutdown = CancellationToken::new();
        let clock = OffsetClock::starting_at(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
        let Tracking {
            module,
            handle,
            watcher,
        } = create_tracking(
            &config,
            Arc::new(UnavailableScreenshotProvider),
            input,
            &shutdown,
            clock,
        )?;
        let module = tokio::spawn(module.run());
        let watcher = tokio::spawn(run_watcher(watcher));

        handle.send(TrackerCommand::Start).await?;
        tokio::time::sleep(run_for).await;
        let state = handle.snapshot();

        shutdown.cancel();
        module.await??;
        let recorded = watcher.await??;
        Ok((state, recorded))
    }

    fn low_threshold(resolution: IdleResolution) -> TrackerConfig {
        TrackerConfig {
            idle_threshold_seconds: 5,
            idle_resolution: resolution,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_period_is_taken_off_elapsed_time() -> Result<()> {
        *TEST_LOGGING;
        let (state, recorded) = run_session(
            low_threshold(IdleResolution::Discard),
            Some(Box::new(NoInputListener)),
            Duration::from_millis(7_500),
        )
        .await?;

        // Resolved after the 6th tick: 6 - 5 = 1, then one more tick.
        assert_eq!(state.elapsed_seconds, 2);
        assert_eq!(state.idle_seconds, 1);
        assert!(state.is_running);
        assert_eq!(recorded, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn recorded_idle_time_is_kept() -> Result<()> {
        let (state, recorded) = run_session(
            low_threshold(IdleResolution::Record),
            Some(Box::new(NoInputListener)),
            Duration::from_millis(7_500),
        )
        .await?;

        assert_eq!(state.elapsed_seconds, 2);
        assert_eq!(recorded, 6);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn active_user_keeps_every_tracked_second() -> Result<()> {
        *TEST_LOGGING;
        let input = IdlePollingListener::new(ActiveUser, IDLE_POLL_INTERVAL);
        let (state, recorded) = run_session(
            TrackerConfig::default(),
            Some(Box::new(input)),
            Duration::from_millis(3_600_500),
        )
        .await?;

        assert_eq!(state.elapsed_seconds, 3600);
        assert!(state.idle_seconds <= 2, "idle {}", state.idle_seconds);
        assert!(state.is_running);
        assert_eq!(recorded, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn without_input_source_idle_is_never_resolved() -> Result<()> {
        let (state, recorded) = run_session(
            TrackerConfig::default(),
            None,
            Duration::from_millis(3_600_500),
        )
        .await?;

        assert_eq!(state.elapsed_seconds, 3600);
        assert_eq!(state.idle_seconds, 3600);
        assert_eq!(recorded, 0);
        Ok(())
    }
}

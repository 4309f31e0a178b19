//! The session tracker. [SessionTracker] owns all timing state of a work session and decides on
//! every tick what has to change. It is driven by [module::TrackerModule], which feeds it ticks,
//! input events and commands from a single task.

pub mod capture;
pub mod config;
pub mod error;
pub mod input;
pub mod module;
pub mod schedule;
pub mod state;

use std::{sync::Arc, time::Duration};

use capture::{CaptureDispatcher, ScreenshotProvider};
use config::{CapturePolicy, TrackerConfig};
use error::TrackerError;
use input::InputListener;
use rand::{rngs::StdRng, Rng, SeedableRng};
use schedule::ScreenshotSchedule;
use state::{InputActivity, SessionState};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::utils::scheduler::{schedule_once, schedule_recurring, ScheduledTask};

const INPUT_BUFFER: usize = 256;

/// What a single [SessionTracker::on_tick] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The tracker is stopped, nothing changed.
    Stopped,
    /// Elapsed time advanced.
    Counted,
    /// Elapsed time advanced and a screenshot capture was launched.
    CaptureRequested,
}

pub struct SessionTracker {
    config: TrackerConfig,
    state: Arc<watch::Sender<SessionState>>,
    schedule: Option<ScreenshotSchedule>,
    rng: StdRng,
    capture: CaptureDispatcher,
    input: Box<dyn InputListener>,
    input_sink: mpsc::Sender<InputActivity>,
    input_events: Option<mpsc::Receiver<InputActivity>>,
    root: CancellationToken,
    /// Token of the current running period. Cancelling it abandons in-flight captures and every
    /// timer armed while running.
    run: Option<CancellationToken>,
    random_delay_captures: Option<ScheduledTask>,
    idle_clock_armed: bool,
}

impl SessionTracker {
    pub fn new(
        config: TrackerConfig,
        provider: Arc<dyn ScreenshotProvider>,
        input: Box<dyn InputListener>,
        root: CancellationToken,
    ) -> Result<Self, TrackerError> {
        config.validate()?;
        let (state, _) = watch::channel(SessionState {
            idle_threshold_seconds: config.idle_threshold_seconds,
            ..Default::default()
        });
        let state = Arc::new(state);
        let (input_sink, input_events) = mpsc::channel(INPUT_BUFFER);

        Ok(Self {
            config,
            capture: CaptureDispatcher::new(provider, state.clone()),
            state,
            schedule: None,
            rng: StdRng::from_entropy(),
            input,
            input_sink,
            input_events: Some(input_events),
            root,
            run: None,
            random_delay_captures: None,
            idle_clock_armed: false,
        })
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.borrow().is_running
    }

    pub fn schedule(&self) -> Option<&ScreenshotSchedule> {
        self.schedule.as_ref()
    }

    /// The idle clock is armed by the first [SessionTracker::start] and stays armed afterwards.
    pub fn idle_clock_armed(&self) -> bool {
        self.idle_clock_armed
    }

    /// Receiving end of the input listener's events. Can only be taken once.
    pub fn take_input_events(&mut self) -> Option<mpsc::Receiver<InputActivity>> {
        self.input_events.take()
    }

    pub fn start(&mut self) -> Result<(), TrackerError> {
        if self.is_running() {
            debug!("Tracker is already running");
            return Ok(());
        }
        self.ensure_schedule()?;
        self.idle_clock_armed = true;
        self.begin_run();
        info!("Tracker started");
        Ok(())
    }

    /// Same as [SessionTracker::start] but keeps consuming the existing schedule.
    pub fn resume(&mut self) -> Result<(), TrackerError> {
        if self.is_running() {
            debug!("Tracker is already running");
            return Ok(());
        }
        self.ensure_schedule()?;
        self.begin_run();
        info!("Tracker resumed");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.state.send_if_modified(|s| std::mem::replace(&mut s.is_running, false));
        self.end_run();
        info!("Tracker stopped");
    }

    /// Stops the tracker and clears elapsed and idle time. Input counters are kept and the
    /// schedule is dropped, so the next start builds a window from zero again.
    pub fn reset(&mut self) {
        self.end_run();
        self.schedule = None;
        self.state.send_modify(|s| {
            s.is_running = false;
            s.elapsed_seconds = 0;
            s.idle_seconds = 0;
        });
        info!("Tracker reset");
    }

    pub fn on_tick(&mut self) -> TickOutcome {
        if !self.is_running() {
            return TickOutcome::Stopped;
        }

        let mut elapsed = 0;
        self.state.send_modify(|s| {
            s.elapsed_seconds += 1;
            s.last_screenshot_age_seconds += 1;
            if s.elapsed_seconds % 60 == 0 {
                s.minutes_since_screenshot += 1;
            }
            elapsed = s.elapsed_seconds;
        });

        if self.config.capture_policy != CapturePolicy::Windowed {
            return TickOutcome::Counted;
        }

        let Some(schedule) = self.schedule.as_mut() else {
            return TickOutcome::Counted;
        };
        if !schedule.poll(elapsed) {
            return TickOutcome::Counted;
        }
        let exhausted = schedule.is_exhausted();

        let requested = self.request_screenshot();

        if exhausted {
            match self.generate_schedule(elapsed) {
                Ok(next) => {
                    debug!("Next screenshot window {:?} offsets {:?}", next.window(), next.offsets());
                    self.schedule = Some(next);
                }
                Err(e) => {
                    error!("Failed to compute next screenshot window {e}");
                    self.schedule = None;
                }
            }
        }

        if requested {
            TickOutcome::CaptureRequested
        } else {
            TickOutcome::Counted
        }
    }

    pub fn on_idle_tick(&mut self) {
        self.state.send_modify(|s| s.idle_seconds += 1);
    }

    pub fn reset_idle_clock(&mut self) {
        self.state.send_modify(|s| {
            s.idle_seconds = 0;
            s.is_idle_clock_running = false;
        });
    }

    pub fn start_idle_clock(&mut self) {
        self.state
            .send_if_modified(|s| !std::mem::replace(&mut s.is_idle_clock_running, true));
    }

    pub fn stop_idle_clock(&mut self) {
        self.state
            .send_if_modified(|s| std::mem::replace(&mut s.is_idle_clock_running, false));
    }

    /// Counts an input event. Any activity means the user is no longer idle.
    pub fn record_activity(&mut self, activity: InputActivity) {
        self.state.send_modify(|s| {
            match activity {
                InputActivity::Key => s.key_event_count += 1,
                InputActivity::MouseButton => s.mouse_event_count += 1,
                InputActivity::MouseMotion => s.mouse_motion_count += 1,
                InputActivity::System => {}
            }
            s.idle_seconds = 0;
        });
    }

    /// Launches a capture in the background. The result lands in the observed state, a failed
    /// capture leaves the previous screenshot in place. Returns `false` when captures are paused.
    pub fn request_screenshot(&self) -> bool {
        let token = self.run.as_ref().unwrap_or(&self.root);
        self.capture.request(token)
    }

    /// Waits for the captures launched so far.
    pub async fn settle_captures(&self) {
        self.capture.settle().await;
    }

    pub fn pause_captures(&mut self) {
        self.state.send_modify(|s| s.captures_paused = true);
    }

    pub fn resume_captures(&mut self) {
        self.state.send_modify(|s| s.captures_paused = false);
    }

    /// Removes an idle period from tracked time. Elapsed time never drops below zero.
    pub fn adjust_for_idle_period(&mut self, offset_seconds: u64) {
        self.state
            .send_modify(|s| s.elapsed_seconds = s.elapsed_seconds.saturating_sub(offset_seconds));
    }

    /// Only stored for the presentation layer. The tracker never compares idle time against it.
    pub fn set_idle_threshold(&mut self, seconds: u32) -> Result<(), TrackerError> {
        if seconds == 0 {
            return Err(TrackerError::ZeroIdleThreshold);
        }
        self.state.send_modify(|s| s.idle_threshold_seconds = seconds);
        Ok(())
    }

    fn ensure_schedule(&mut self) -> Result<(), TrackerError> {
        if self.config.capture_policy == CapturePolicy::Windowed && self.schedule.is_none() {
            let elapsed = self.state.borrow().elapsed_seconds;
            let schedule = self.generate_schedule(elapsed)?;
            debug!(
                "Screenshot window {:?} offsets {:?}",
                schedule.window(),
                schedule.offsets()
            );
            self.schedule = Some(schedule);
        }
        Ok(())
    }

    fn generate_schedule(&mut self, window_start: u64) -> Result<ScreenshotSchedule, TrackerError> {
        ScreenshotSchedule::generate(
            &mut self.rng,
            window_start,
            self.config.window_seconds,
            self.config.screenshots_per_window,
        )
    }

    fn begin_run(&mut self) {
        let run = self.root.child_token();
        self.state.send_modify(|s| s.is_running = true);

        if let Err(e) = self.input.register(self.input_sink.clone()) {
            warn!("Failed to register input listener {e:?}");
        }

        if let CapturePolicy::RandomDelay { period_seconds } = self.config.capture_policy {
            let seed = self.rng.gen();
            self.random_delay_captures = Some(spawn_random_delay_captures(
                &run,
                self.capture.clone(),
                Duration::from_secs(period_seconds),
                StdRng::seed_from_u64(seed),
            ));
        }

        self.run = Some(run);
    }

    fn end_run(&mut self) {
        if let Some(run) = self.run.take() {
            run.cancel();
            self.input.unregister();
        }
        self.random_delay_captures.take();
    }
}

impl Drop for SessionTracker {
    fn drop(&mut self) {
        self.end_run();
    }
}

/// Every `period` arms one capture at a random delay inside the period. Arming a new capture
/// replaces the previous one-shot timer.
fn spawn_random_delay_captures(
    run: &CancellationToken,
    capture: CaptureDispatcher,
    period: Duration,
    mut rng: StdRng,
) -> ScheduledTask {
    let run_token = run.clone();
    let period_ms = period.as_millis().max(1) as u64;
    // Replacing the handle drops, and so cancels, the previous one-shot timer.
    let mut _pending: Option<ScheduledTask> = None;
    schedule_recurring(run, Duration::ZERO, period, move || {
        let delay = Duration::from_millis(rng.gen_range(0..period_ms));
        debug!("Next screenshot in {delay:?}");
        let capture = capture.clone();
        let token = run_token.clone();
        _pending = Some(schedule_once(&run_token, delay, move || {
            capture.request(&token);
            Ok(())
        }));
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::Utc;
    use rand::{rngs::StdRng, SeedableRng};
    use tokio_util::sync::CancellationToken;

    use super::{
        capture::{MockScreenshotProvider, ScreenshotProvider, UnavailableScreenshotProvider},
        config::{CapturePolicy, TrackerConfig},
        error::TrackerError,
        input::{MockInputListener, NoInputListener},
        state::{InputActivity, Screenshot},
        SessionTracker, TickOutcome,
    };
    use crate::utils::logging::TEST_LOGGING;

    fn screenshot(name: &str) -> Screenshot {
        Screenshot {
            path: PathBuf::from(name),
            taken_at: Utc::now(),
            width: 1,
            height: 1,
        }
    }

    fn tracker(provider: impl ScreenshotProvider, config: TrackerConfig) -> SessionTracker {
        SessionTracker::new(
            config,
            Arc::new(provider),
            Box::new(NoInputListener),
            CancellationToken::new(),
        )
        .unwrap()
        .with_rng(StdRng::seed_from_u64(42))
    }

    #[derive(Default, Clone)]
    struct CountingProvider {
        captures: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ScreenshotProvider for CountingProvider {
        async fn capture(&self) -> Result<Screenshot> {
            let index = self.captures.fetch_add(1, Ordering::SeqCst);
            Ok(screenshot(&format!("{index}.png")))
        }
    }

    #[tokio::test]
    async fn reaching_first_offset_requests_exactly_one_capture() {
        *TEST_LOGGING;
        let mut provider = MockScreenshotProvider::new();
        provider
            .expect_capture()
            .times(1)
            .returning(|| Ok(screenshot("first.png")));
        let mut tracker = tracker(provider, TrackerConfig::default());

        tracker.start().unwrap();
        let offset = tracker.schedule().unwrap().next_offset().unwrap();
        assert!(offset < 60);

        let ticks = offset.max(1);
        let outcomes = (0..ticks).map(|_| tracker.on_tick()).collect::<Vec<_>>();
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == TickOutcome::CaptureRequested)
                .count(),
            1
        );
        assert_eq!(outcomes.last(), Some(&TickOutcome::CaptureRequested));

        tracker.settle_captures().await;
        let state = tracker.state();
        assert_eq!(
            state.last_screenshot.as_deref().map(|s| s.path.clone()),
            Some(PathBuf::from("first.png"))
        );
        assert_eq!(state.last_screenshot_age_seconds, 0);
    }

    #[tokio::test]
    async fn one_capture_per_window() {
        let provider = CountingProvider::default();
        let mut tracker = tracker(provider.clone(), TrackerConfig::default());
        tracker.start().unwrap();

        let first = tracker.schedule().unwrap().next_offset().unwrap();
        let mut captures = 0;
        for _ in 0..first.max(1) {
            if tracker.on_tick() == TickOutcome::CaptureRequested {
                captures += 1;
            }
        }
        assert_eq!(captures, 1);

        let window = tracker.schedule().unwrap().window();
        assert_eq!(window.start, first.max(1));
        assert_eq!(window.end - window.start, 60);
        let second = tracker.schedule().unwrap().next_offset().unwrap();

        while tracker.state().elapsed_seconds + 1 < second.max(window.start + 1) {
            assert_eq!(tracker.on_tick(), TickOutcome::Counted);
        }
        assert_eq!(tracker.on_tick(), TickOutcome::CaptureRequested);

        tracker.settle_captures().await;
        assert_eq!(provider.captures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stopped_tracker_never_captures() {
        let mut provider = MockScreenshotProvider::new();
        provider.expect_capture().times(0);
        let mut tracker = tracker(provider, TrackerConfig::default());

        tracker.start().unwrap();
        tracker.stop();
        for _ in 0..300 {
            assert_eq!(tracker.on_tick(), TickOutcome::Stopped);
        }
        tracker.settle_captures().await;
        assert_eq!(tracker.state().elapsed_seconds, 0);
    }

    #[tokio::test]
    async fn failed_capture_keeps_previous_screenshot() {
        *TEST_LOGGING;
        let mut provider = MockScreenshotProvider::new();
        let mut sequence = mockall::Sequence::new();
        provider
            .expect_capture()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|| Ok(screenshot("kept.png")));
        provider
            .expect_capture()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|| Err(anyhow!("permission denied")));
        let mut tracker = tracker(provider, TrackerConfig::default());

        tracker.start().unwrap();
        assert!(tracker.request_screenshot());
        tracker.settle_captures().await;
        tracker.state.send_modify(|s| s.last_screenshot_age_seconds = 5);
        tracker.pause_captures();
        assert!(!tracker.request_screenshot());
        tracker.resume_captures();
        assert!(tracker.request_screenshot());
        tracker.settle_captures().await;

        let state = tracker.state();
        assert_eq!(
            state.last_screenshot.as_deref().map(|s| s.path.clone()),
            Some(PathBuf::from("kept.png"))
        );
        assert_eq!(state.last_screenshot_age_seconds, 5);
    }

    #[tokio::test]
    async fn reset_starts_elapsed_over() {
        let mut tracker = tracker(UnavailableScreenshotProvider, TrackerConfig::default());
        tracker.start().unwrap();
        for _ in 0..30 {
            tracker.on_tick();
        }
        tracker.record_activity(InputActivity::Key);
        tracker.on_idle_tick();

        tracker.reset();
        assert!(!tracker.is_running());
        assert!(tracker.schedule().is_none());
        tracker.start().unwrap();
        tracker.on_tick();

        let state = tracker.state();
        assert_eq!(state.elapsed_seconds, 1);
        assert_eq!(state.idle_seconds, 0);
        assert_eq!(state.key_event_count, 1);
        assert_eq!(tracker.schedule().unwrap().window(), 0..60);
    }

    #[tokio::test]
    async fn minute_boundaries_bump_screenshot_counter() {
        let mut tracker = tracker(UnavailableScreenshotProvider, TrackerConfig::default());
        tracker.start().unwrap();
        for _ in 0..125 {
            tracker.on_tick();
        }
        tracker.settle_captures().await;

        let state = tracker.state();
        assert_eq!(state.minutes_since_screenshot, 2);
        assert_eq!(state.last_screenshot_age_seconds, 125);
        assert!(state.last_screenshot.is_none());
    }

    #[test]
    fn idle_adjustment_never_goes_negative() {
        let mut tracker = tracker(UnavailableScreenshotProvider, TrackerConfig::default());
        tracker.adjust_for_idle_period(10);
        assert_eq!(tracker.state().elapsed_seconds, 0);

        tracker.start().unwrap();
        for _ in 0..20 {
            tracker.state.send_modify(|s| s.elapsed_seconds += 1);
        }
        tracker.adjust_for_idle_period(5);
        assert_eq!(tracker.state().elapsed_seconds, 15);
        tracker.adjust_for_idle_period(u64::MAX);
        assert_eq!(tracker.state().elapsed_seconds, 0);
    }

    #[test]
    fn idle_ticks_are_reported_faithfully() {
        let mut tracker = tracker(UnavailableScreenshotProvider, TrackerConfig::default());
        tracker.set_idle_threshold(480).unwrap();
        for _ in 0..481 {
            tracker.on_idle_tick();
        }
        let state = tracker.state();
        assert_eq!(state.idle_seconds, 481);
        assert_eq!(state.idle_threshold_seconds, 480);
        assert!(state.idle_threshold_exceeded());
        assert!(!state.is_running);
    }

    #[test]
    fn activity_resets_idle_time() {
        let mut tracker = tracker(UnavailableScreenshotProvider, TrackerConfig::default());
        tracker.start_idle_clock();
        for _ in 0..10 {
            tracker.on_idle_tick();
        }
        tracker.record_activity(InputActivity::MouseButton);
        tracker.record_activity(InputActivity::MouseMotion);
        tracker.record_activity(InputActivity::MouseMotion);

        let state = tracker.state();
        assert_eq!(state.idle_seconds, 0);
        assert_eq!(state.mouse_event_count, 1);
        assert_eq!(state.mouse_motion_count, 2);
        assert!(state.is_idle_clock_running);

        tracker.on_idle_tick();
        tracker.record_activity(InputActivity::System);
        let state = tracker.state();
        assert_eq!(state.idle_seconds, 0);
        assert_eq!(
            (state.key_event_count, state.mouse_event_count, state.mouse_motion_count),
            (0, 1, 2)
        );

        tracker.on_idle_tick();
        tracker.reset_idle_clock();
        let state = tracker.state();
        assert_eq!(state.idle_seconds, 0);
        assert!(!state.is_idle_clock_running);
    }

    #[test]
    fn zero_idle_threshold_is_rejected() {
        let mut tracker = tracker(UnavailableScreenshotProvider, TrackerConfig::default());
        assert_eq!(
            tracker.set_idle_threshold(0),
            Err(TrackerError::ZeroIdleThreshold)
        );
        assert_eq!(tracker.state().idle_threshold_seconds, 480);
    }

    #[test]
    fn invalid_config_fails_on_creation() {
        let config = TrackerConfig {
            window_seconds: 100,
            screenshots_per_window: 3,
            ..Default::default()
        };
        let result = SessionTracker::new(
            config,
            Arc::new(UnavailableScreenshotProvider),
            Box::new(NoInputListener),
            CancellationToken::new(),
        );
        assert!(matches!(
            result,
            Err(TrackerError::UnevenWindow {
                window: 100,
                intervals: 3
            })
        ));
    }

    #[test]
    fn start_is_idempotent_and_resume_keeps_schedule() {
        let mut input = MockInputListener::new();
        input.expect_register().times(2).returning(|_| Ok(()));
        input.expect_unregister().times(2).return_const(());
        let mut tracker = SessionTracker::new(
            TrackerConfig {
                screenshots_per_window: 4,
                ..Default::default()
            },
            Arc::new(UnavailableScreenshotProvider),
            Box::new(input),
            CancellationToken::new(),
        )
        .unwrap();

        assert!(!tracker.idle_clock_armed());
        tracker.start().unwrap();
        assert!(tracker.idle_clock_armed());
        let schedule = tracker.schedule().cloned();
        tracker.start().unwrap();
        tracker.stop();
        tracker.resume().unwrap();
        assert_eq!(tracker.schedule().cloned(), schedule);
        tracker.stop();
        tracker.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn random_delay_policy_stops_with_tracker() {
        *TEST_LOGGING;
        let provider = CountingProvider::default();
        let mut tracker = tracker(
            provider.clone(),
            TrackerConfig {
                capture_policy: CapturePolicy::RandomDelay { period_seconds: 60 },
                ..Default::default()
            },
        );
        tracker.start().unwrap();
        assert!(tracker.schedule().is_none());

        tokio::time::sleep(Duration::from_secs(150)).await;
        tracker.settle_captures().await;
        let captured = provider.captures.load(Ordering::SeqCst);
        assert!((2..=3).contains(&captured), "captured {captured}");

        tracker.stop();
        tokio::time::sleep(Duration::from_secs(600)).await;
        tracker.settle_captures().await;
        assert_eq!(provider.captures.load(Ordering::SeqCst), captured);

        for _ in 0..120 {
            assert_eq!(tracker.on_tick(), TickOutcome::Stopped);
        }
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Source of wall-clock timestamps and tick deadlines for the tracker. Wall-clock time is only
/// used to stamp reports and screenshots, every interval is measured on the monotonic side so
/// paused tokio time drives tests.
#[async_trait]
pub trait Clock: Sync + Send + 'static {
    fn time(&self) -> DateTime<Utc>;

    fn instant(&self) -> Instant;

    async fn sleep_until(&self, instant: Instant);
}

pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, instant: Instant) {
        tokio::time::sleep_until(instant).await;
    }
}

/// Clock pinned to a fixed wall-clock origin that advances together with tokio time.
#[derive(Clone)]
pub struct OffsetClock {
    origin: DateTime<Utc>,
    reference: Instant,
}

impl OffsetClock {
    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            reference: Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for OffsetClock {
    fn time(&self) -> DateTime<Utc> {
        self.origin + self.reference.elapsed()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, instant: Instant) {
        tokio::time::sleep_until(instant).await;
    }
}

//! Injectable time source for the poll loops and retry backoff.
//!
//! [`TokioClock`] derives wall-clock timestamps from tokio's monotonic clock,
//! anchored once at construction. Under `tokio::time::pause` the whole engine,
//! timestamps included, therefore runs on simulated time.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// A source of time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time, used for sample timestamps.
    fn now(&self) -> DateTime<Utc>;

    /// Current monotonic instant, used for scheduling.
    fn instant(&self) -> Instant;

    /// Completes at `deadline`.
    fn sleep_until(&self, deadline: Instant) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

    /// Completes after `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        self.sleep_until(self.instant() + duration)
    }
}

/// Clock backed by `tokio::time`.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    wall_anchor: DateTime<Utc>,
    instant_anchor: Instant,
}

impl TokioClock {
    /// Anchors a new clock at the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            wall_anchor: Utc::now(),
            instant_anchor: Instant::now(),
        }
    }

    /// Anchors a new clock at a fixed wall time, for reproducible timestamps.
    #[must_use]
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall_anchor: wall,
            instant_anchor: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.instant_anchor.elapsed();
        chrono::Duration::from_std(elapsed).map_or(self.wall_anchor, |d| self.wall_anchor + d)
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep_until(deadline))
    }
}

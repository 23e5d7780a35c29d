//! Fixed-period refresh clock
//!
//! Decouples the arrival rate of fragments from the rate at which observers
//! are notified: at most one notification per period, and only when
//! something changed.

use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Default refresh period while streaming
pub const DEFAULT_THROTTLE_PERIOD: Duration = Duration::from_millis(30);

pub struct ThrottleClock {
    period: Duration,
    interval: Option<Interval>,
}

impl ThrottleClock {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            interval: None,
        }
    }

    /// Start ticking; the first tick lands one full period from now.
    /// Restarting replaces any running interval.
    pub fn start(&mut self) {
        let mut interval = interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
    }

    /// Safe to call when already stopped
    pub fn stop(&mut self) {
        self.interval = None;
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Resolves on the next tick; pends forever while stopped
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

//! Single-shot stall timer
//!
//! Backstop against a backend that stops sending without closing the
//! connection. Every fragment pushes the deadline out again.

use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, Instant, Sleep};

/// Default stall timeout, sized for multi-stage backend pipelines
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(600);

pub struct StallWatchdog {
    timeout: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl StallWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    /// Arm, or push the deadline out if already armed
    pub fn restart(&mut self) {
        let at = Instant::now() + self.timeout;
        match self.deadline.as_mut() {
            Some(deadline) => deadline.as_mut().reset(at),
            None => self.deadline = Some(Box::pin(sleep(self.timeout))),
        }
    }

    /// Safe to call when already disarmed
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves once when the deadline passes, disarming the watchdog;
    /// pends forever while disarmed
    pub async fn expired(&mut self) {
        match self.deadline.as_mut() {
            Some(deadline) => {
                deadline.as_mut().await;
                self.deadline = None;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

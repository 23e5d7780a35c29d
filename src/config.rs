//! Session configuration

use crate::throttle::DEFAULT_THROTTLE_PERIOD;
use crate::watchdog::DEFAULT_STALL_TIMEOUT;
use std::time::Duration;

/// Timing knobs for the session runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Minimum spacing between streaming notifications
    pub throttle_period: Duration,
    /// Silence after which an in-flight turn is abandoned
    pub stall_timeout: Duration,
    /// Capacity of the command queue
    pub command_buffer: usize,
    /// Capacity of the snapshot broadcast; slow observers skip ahead
    pub update_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            throttle_period: DEFAULT_THROTTLE_PERIOD,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            command_buffer: 32,
            update_buffer: 256,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset or unparseable values
    /// keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            throttle_period: number("CHAT_SESSION_THROTTLE_MS")
                .filter(|ms| *ms > 0)
                .map_or(defaults.throttle_period, Duration::from_millis),
            stall_timeout: number("CHAT_SESSION_STALL_TIMEOUT_SECS")
                .filter(|secs| *secs > 0)
                .map_or(defaults.stall_timeout, Duration::from_secs),
            ..defaults
        }
    }
}

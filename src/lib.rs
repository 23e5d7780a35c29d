//! Chat session coordinator
//!
//! Client-side coordinator for a turn-based chat assistant. It owns the
//! in-flight turn: opens the engine stream, coalesces fragments into
//! throttled observer updates, abandons stalled streams, and reconciles the
//! cached conversation with the durable store once the turn ends.

pub mod aggregator;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod reconcile;
pub mod runtime;
pub mod state_machine;
pub mod store;
pub mod throttle;
pub mod watchdog;

pub use config::SessionConfig;
pub use error::SessionError;
pub use runtime::{spawn_session, CommandOutcome, SessionHandle, SessionSnapshot, SkipReason};

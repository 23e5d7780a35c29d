//! Session state types

use crate::reconcile::TerminationCause;
use serde::Serialize;

/// Lifecycle state of the session
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionState {
    /// No active turn
    #[default]
    Idle,

    /// Subscription open, buffers live
    Streaming {
        turn_id: u64,
        /// Business error reported by the engine; not terminal by itself
        recorded_error: Option<String>,
    },

    /// Stream over, waiting for the conversation to be re-read
    Settling {
        turn_id: u64,
        cause: TerminationCause,
        recorded_error: Option<String>,
    },
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Idle => SessionPhase::Idle,
            SessionState::Streaming { .. } => SessionPhase::Streaming,
            SessionState::Settling { .. } => SessionPhase::Settling,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, SessionState::Streaming { .. })
    }

    /// Turn currently owning the session, if any
    pub fn turn_id(&self) -> Option<u64> {
        match self {
            SessionState::Idle => None,
            SessionState::Streaming { turn_id, .. } | SessionState::Settling { turn_id, .. } => {
                Some(*turn_id)
            }
        }
    }
}

/// Coarse lifecycle phase exposed to observers
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    Streaming,
    Settling,
}

//! Derives the final state of a turn from the authoritative conversation
//!
//! Transient buffers are never trusted once a turn ends. The runtime
//! re-fetches the conversation, and [`resolve`] decides which message list
//! and which error the session publishes.

use crate::model::{Conversation, Role};
use serde::Serialize;

/// Shown when a stream ended without a reply being persisted
pub const INTERRUPTED_MESSAGE: &str = "Response interrupted, please retry";

/// Shown when the conversation could not be re-read after a turn
pub const RELOAD_FAILED_MESSAGE: &str = "Could not reload the conversation, please retry";

/// Why a turn left the streaming state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    /// Explicit done event
    Done,
    /// Error event followed by the stream closing
    BusinessError,
    /// Stream closed or broke without a terminal event
    AbruptClose,
    /// Stall watchdog expired
    Timeout,
}

impl TerminationCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::BusinessError => "business_error",
            Self::AbruptClose => "abrupt_close",
            Self::Timeout => "timeout",
        }
    }

    /// Whether the engine said how the turn ended
    pub fn is_explicit(self) -> bool {
        matches!(self, Self::Done | Self::BusinessError)
    }
}

/// Result of re-reading the conversation at the end of a turn
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Loaded(Conversation),
    Missing,
    Failed(String),
}

/// What the session publishes once a turn has settled
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// Replacement for the cached conversation; `None` keeps only the cached
    /// messages the store already has
    pub conversation: Option<Conversation>,
    pub error: Option<String>,
}

/// Decide the settled state of a turn.
///
/// Explicit endings trust whatever error the engine reported. Inferred
/// endings look at the reloaded conversation: a trailing assistant message
/// means the reply made it to the store even though the terminal event did
/// not make it to us.
pub fn resolve(
    cause: TerminationCause,
    recorded_error: Option<&str>,
    fetched: FetchOutcome,
) -> Reconciliation {
    match fetched {
        FetchOutcome::Loaded(conversation) => {
            let error = if cause.is_explicit() {
                recorded_error.map(str::to_string)
            } else if conversation.last_role() == Some(Role::Assistant) {
                None
            } else {
                Some(recorded_error.unwrap_or(INTERRUPTED_MESSAGE).to_string())
            };
            Reconciliation {
                conversation: Some(conversation),
                error,
            }
        }
        FetchOutcome::Missing | FetchOutcome::Failed(_) => Reconciliation {
            conversation: None,
            error: Some(recorded_error.unwrap_or(RELOAD_FAILED_MESSAGE).to_string()),
        },
    }
}

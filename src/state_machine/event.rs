//! Events that can occur during a session

use crate::engine::GenerationRequest;
use crate::reconcile::FetchOutcome;

/// Events that trigger state transitions.
///
/// Stream events carry the id of the turn whose subscription produced them;
/// anything tagged with a turn that is no longer current is dropped.
#[derive(Debug, Clone)]
pub enum Event {
    /// A turn operation finished its preparation and wants to stream
    BeginTurn {
        turn_id: u64,
        request: GenerationRequest,
    },

    // Subscription events
    ContentDelta {
        turn_id: u64,
        text: String,
    },
    ThinkingDelta {
        turn_id: u64,
        text: String,
    },
    EngineDone {
        turn_id: u64,
    },
    EngineError {
        turn_id: u64,
        message: String,
    },
    /// The sequence ended with no further items
    StreamClosed {
        turn_id: u64,
    },
    /// The stream could not be opened or broke mid-way
    StreamFailed {
        turn_id: u64,
        message: String,
    },

    // Timer events
    WatchdogFired,
    ThrottleTick,

    /// The conversation was re-read after the turn ended
    Reconciled {
        turn_id: u64,
        fetched: FetchOutcome,
    },
}

impl Event {
    /// Turn this event belongs to; timer events belong to whichever is current
    pub fn turn_id(&self) -> Option<u64> {
        match self {
            Event::BeginTurn { turn_id, .. }
            | Event::ContentDelta { turn_id, .. }
            | Event::ThinkingDelta { turn_id, .. }
            | Event::EngineDone { turn_id }
            | Event::EngineError { turn_id, .. }
            | Event::StreamClosed { turn_id }
            | Event::StreamFailed { turn_id, .. }
            | Event::Reconciled { turn_id, .. } => Some(*turn_id),
            Event::WatchdogFired | Event::ThrottleTick => None,
        }
    }
}

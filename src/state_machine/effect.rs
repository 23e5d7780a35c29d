//! Effects produced by state transitions

use crate::engine::GenerationRequest;
use crate::model::Conversation;
use crate::reconcile::TerminationCause;

/// Effects to be executed after state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Cancel the event subscription, if one is open
    CancelSubscription,

    /// Empty the content and thinking buffers
    ResetBuffers,

    /// Start the throttle clock and arm the stall watchdog
    StartTimers,

    /// Publish a snapshot to observers
    NotifyObservers,

    /// Open the engine stream for this turn (spawns a forwarding task)
    Subscribe {
        turn_id: u64,
        request: GenerationRequest,
    },

    AppendContent(String),
    AppendThinking(String),

    /// Push the stall deadline out
    RestartWatchdog,

    /// Notify observers only if the buffers changed since the last notification
    FlushIfDirty,

    /// Stop timers, clear the active flag, flush. Idempotent.
    ExitStreaming,

    /// Re-read the conversation; yields [`Event::Reconciled`](super::Event::Reconciled)
    Reconcile { turn_id: u64 },

    /// Replace the cached conversation and publish the turn's outcome
    ApplyReconciliation {
        cause: TerminationCause,
        conversation: Option<Conversation>,
        error: Option<String>,
    },

    /// Fire-and-forget memory summarization check
    SummarizeMemory,
}

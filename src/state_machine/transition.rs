//! Pure state transition function

use super::{Effect, Event, SessionState};
use crate::reconcile::{self, TerminationCause};
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: SessionState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: SessionState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    /// Keep the current state, do nothing
    pub fn unchanged(state: &SessionState) -> Self {
        Self::new(state.clone())
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("A reply is already being generated")]
    Busy,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Pure transition function.
///
/// Given the same state and event it always produces the same result and
/// performs no I/O.
pub fn transition(state: &SessionState, event: Event) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        // ============================================================
        // Turn start
        // ============================================================

        // Prior subscription and timers are torn down before anything else,
        // in case the previous teardown never ran
        (SessionState::Idle, Event::BeginTurn { turn_id, request }) => Ok(TransitionResult::new(
            SessionState::Streaming {
                turn_id,
                recorded_error: None,
            },
        )
        .with_effects([
            Effect::CancelSubscription,
            Effect::ResetBuffers,
            Effect::StartTimers,
            Effect::NotifyObservers,
            Effect::Subscribe { turn_id, request },
        ])),

        (_, Event::BeginTurn { .. }) => Err(TransitionError::Busy),

        // ============================================================
        // Fragments
        // ============================================================
        (SessionState::Streaming { turn_id, .. }, Event::ContentDelta { turn_id: t, text })
            if t == *turn_id =>
        {
            Ok(TransitionResult::unchanged(state)
                .with_effect(Effect::AppendContent(text))
                .with_effect(Effect::RestartWatchdog))
        }

        (SessionState::Streaming { turn_id, .. }, Event::ThinkingDelta { turn_id: t, text })
            if t == *turn_id =>
        {
            Ok(TransitionResult::unchanged(state)
                .with_effect(Effect::AppendThinking(text))
                .with_effect(Effect::RestartWatchdog))
        }

        (SessionState::Streaming { .. }, Event::ThrottleTick) => {
            Ok(TransitionResult::unchanged(state).with_effect(Effect::FlushIfDirty))
        }

        // Recorded, but the engine may still send done afterwards
        (SessionState::Streaming { turn_id, .. }, Event::EngineError { turn_id: t, message })
            if t == *turn_id =>
        {
            Ok(TransitionResult::new(SessionState::Streaming {
                turn_id: t,
                recorded_error: Some(message),
            }))
        }

        // ============================================================
        // Leaving Streaming
        // ============================================================
        (
            SessionState::Streaming {
                turn_id,
                recorded_error,
            },
            Event::EngineDone { turn_id: t },
        ) if t == *turn_id => Ok(settle(t, TerminationCause::Done, recorded_error.clone())),

        (
            SessionState::Streaming {
                turn_id,
                recorded_error,
            },
            Event::StreamClosed { turn_id: t },
        ) if t == *turn_id => {
            let cause = if recorded_error.is_some() {
                TerminationCause::BusinessError
            } else {
                TerminationCause::AbruptClose
            };
            Ok(settle(t, cause, recorded_error.clone()))
        }

        (
            SessionState::Streaming {
                turn_id,
                recorded_error,
            },
            Event::StreamFailed { turn_id: t, .. },
        ) if t == *turn_id => Ok(settle(
            t,
            TerminationCause::AbruptClose,
            recorded_error.clone(),
        )),

        (
            SessionState::Streaming {
                turn_id,
                recorded_error,
            },
            Event::WatchdogFired,
        ) => Ok(settle(
            *turn_id,
            TerminationCause::Timeout,
            recorded_error.clone(),
        )),

        // ============================================================
        // Settling -> Idle
        // ============================================================
        (
            SessionState::Settling {
                turn_id,
                cause,
                recorded_error,
            },
            Event::Reconciled { turn_id: t, fetched },
        ) if t == *turn_id => {
            let outcome = reconcile::resolve(*cause, recorded_error.as_deref(), fetched);
            let result = TransitionResult::new(SessionState::Idle)
                .with_effect(Effect::ApplyReconciliation {
                    cause: *cause,
                    conversation: outcome.conversation,
                    error: outcome.error,
                })
                .with_effect(Effect::NotifyObservers);

            if *cause == TerminationCause::Done {
                Ok(result.with_effect(Effect::SummarizeMemory))
            } else {
                Ok(result)
            }
        }

        (_, Event::Reconciled { turn_id, .. }) => Err(TransitionError::InvalidTransition(
            format!("reconciliation for turn {turn_id} outside of settling"),
        )),

        // ============================================================
        // Stale events
        // ============================================================

        // Late output of a cancelled subscription, a second terminal event,
        // or a timer that raced the settle
        (
            _,
            Event::ContentDelta { .. }
            | Event::ThinkingDelta { .. }
            | Event::EngineDone { .. }
            | Event::EngineError { .. }
            | Event::StreamClosed { .. }
            | Event::StreamFailed { .. }
            | Event::WatchdogFired
            | Event::ThrottleTick,
        ) => Ok(TransitionResult::unchanged(state)),
    }
}

/// Leave Streaming: exit actions first, then re-read the conversation
fn settle(
    turn_id: u64,
    cause: TerminationCause,
    recorded_error: Option<String>,
) -> TransitionResult {
    TransitionResult::new(SessionState::Settling {
        turn_id,
        cause,
        recorded_error,
    })
    .with_effects([
        Effect::CancelSubscription,
        Effect::ExitStreaming,
        Effect::Reconcile { turn_id },
    ])
}

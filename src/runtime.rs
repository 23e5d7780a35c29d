//! Session runtime
//!
//! A single task owns all mutable session state. Callers talk to it through
//! a cloneable [`SessionHandle`]; observers receive [`SessionSnapshot`]s over
//! a broadcast channel (one per notification) and a watch channel (latest
//! only).

mod executor;
mod turns;

#[cfg(test)]
pub mod testing;

pub use executor::SessionRuntime;

use crate::config::SessionConfig;
use crate::engine::{all_models, GenerationEngine, ModelDef};
use crate::error::SessionError;
use crate::model::{Character, ConversationSummary, DialogueStyle, Message};
use crate::state_machine::SessionPhase;
use crate::store::{ConversationStore, ProfileRepository};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Point-in-time view of the session published to observers
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    /// True while a turn is streaming
    pub active: bool,
    /// Reply text received so far for the current turn
    pub content: String,
    pub thinking: String,
    pub error: Option<String>,
    /// Text of the most recent turn that ended in an error
    pub last_failed_input: Option<String>,
    pub conversations: Arc<Vec<ConversationSummary>>,
    pub conversation_id: Option<String>,
    pub dialogue_style: DialogueStyle,
    pub messages: Arc<Vec<Message>>,
    pub character: Option<Character>,
    /// Model the user selected
    pub model: String,
    pub thinking_enabled: bool,
    /// Turns that have completed reconciliation
    pub settled_turns: u64,
}

/// Why a command was accepted but did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A turn is in flight
    Busy,
    EmptyInput,
    NoConversation,
}

/// Result of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// A turn is now streaming
    Started,
    /// The command took effect
    Applied,
    Skipped(SkipReason),
    /// The command failed before any stream was opened; the message is also
    /// published as the session error
    Failed(String),
}

impl CommandOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started)
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Send { text: String },
    Retry,
    Regenerate { message_id: String },
    EditAndResend { message_id: String, text: String },
    RollbackTo { message_id: String },
    EditMessage { message_id: String, text: String },
    RestartStory,
    ClearError,
    NewConversation { character_id: Option<String> },
    OpenConversation { id: String },
    DeleteConversation { id: String },
    RefreshConversations,
    SetDialogueStyle(DialogueStyle),
    SetModel(String),
    SetThinking(bool),
    BindCharacter(Option<String>),
    Shutdown,
}

impl Command {
    /// Commands that would race a streaming turn and are refused meanwhile
    pub(crate) fn requires_idle(&self) -> bool {
        matches!(
            self,
            Self::Send { .. }
                | Self::Retry
                | Self::Regenerate { .. }
                | Self::EditAndResend { .. }
                | Self::RollbackTo { .. }
                | Self::EditMessage { .. }
                | Self::RestartStory
                | Self::NewConversation { .. }
                | Self::OpenConversation { .. }
                | Self::DeleteConversation { .. }
                | Self::SetDialogueStyle(_)
                | Self::BindCharacter(_)
        )
    }
}

pub(crate) struct CommandRequest {
    pub command: Command,
    pub reply: oneshot::Sender<CommandOutcome>,
}

/// Handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::Sender<CommandRequest>,
    updates_tx: broadcast::Sender<SessionSnapshot>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Send a new user message
    pub async fn send(&self, text: impl Into<String>) -> Result<CommandOutcome, SessionError> {
        self.request(Command::Send { text: text.into() }).await
    }

    /// Ask for a fresh reply to the conversation as stored, without new text
    pub async fn retry(&self) -> Result<CommandOutcome, SessionError> {
        self.request(Command::Retry).await
    }

    /// Drop an assistant message and everything after it, then generate again
    pub async fn regenerate(
        &self,
        message_id: impl Into<String>,
    ) -> Result<CommandOutcome, SessionError> {
        self.request(Command::Regenerate {
            message_id: message_id.into(),
        })
        .await
    }

    /// Replace a user message (and everything after it) with new text
    pub async fn edit_and_resend(
        &self,
        message_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<CommandOutcome, SessionError> {
        self.request(Command::EditAndResend {
            message_id: message_id.into(),
            text: text.into(),
        })
        .await
    }

    /// Delete a message and everything after it
    pub async fn rollback_to_message(
        &self,
        message_id: impl Into<String>,
    ) -> Result<CommandOutcome, SessionError> {
        self.request(Command::RollbackTo {
            message_id: message_id.into(),
        })
        .await
    }

    /// Change a message's text without regenerating anything
    pub async fn edit_message(
        &self,
        message_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<CommandOutcome, SessionError> {
        self.request(Command::EditMessage {
            message_id: message_id.into(),
            text: text.into(),
        })
        .await
    }

    /// Drop everything but the system prompt and the greeting, and forget
    /// the conversation's memory
    pub async fn restart_story(&self) -> Result<CommandOutcome, SessionError> {
        self.request(Command::RestartStory).await
    }

    pub async fn clear_error(&self) -> Result<CommandOutcome, SessionError> {
        self.request(Command::ClearError).await
    }

    pub async fn new_conversation(
        &self,
        character_id: Option<String>,
    ) -> Result<CommandOutcome, SessionError> {
        self.request(Command::NewConversation { character_id }).await
    }

    pub async fn open_conversation(
        &self,
        id: impl Into<String>,
    ) -> Result<CommandOutcome, SessionError> {
        self.request(Command::OpenConversation { id: id.into() }).await
    }

    pub async fn delete_conversation(
        &self,
        id: impl Into<String>,
    ) -> Result<CommandOutcome, SessionError> {
        self.request(Command::DeleteConversation { id: id.into() }).await
    }

    pub async fn refresh_conversations(&self) -> Result<CommandOutcome, SessionError> {
        self.request(Command::RefreshConversations).await
    }

    pub async fn set_dialogue_style(
        &self,
        style: DialogueStyle,
    ) -> Result<CommandOutcome, SessionError> {
        self.request(Command::SetDialogueStyle(style)).await
    }

    pub async fn set_model(&self, model: impl Into<String>) -> Result<CommandOutcome, SessionError> {
        self.request(Command::SetModel(model.into())).await
    }

    pub async fn set_thinking(&self, enabled: bool) -> Result<CommandOutcome, SessionError> {
        self.request(Command::SetThinking(enabled)).await
    }

    /// Bind a character to the open conversation, or pick one for the next
    /// conversation when none is open. `None` unbinds.
    pub async fn bind_character(
        &self,
        character_id: Option<String>,
    ) -> Result<CommandOutcome, SessionError> {
        self.request(Command::BindCharacter(character_id)).await
    }

    /// Stop the runtime, cancelling any in-flight turn
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(Command::Shutdown).await.map(|_| ())
    }

    /// Models that can be passed to [`set_model`](Self::set_model)
    pub fn available_models(&self) -> &'static [ModelDef] {
        all_models()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receive every published snapshot
    pub fn subscribe(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.updates_tx.subscribe()
    }

    /// Receive only the latest snapshot
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    async fn request(&self, command: Command) -> Result<CommandOutcome, SessionError> {
        let (reply, reply_rx) = oneshot::channel();
        self.command_tx
            .send(CommandRequest { command, reply })
            .await
            .map_err(|_| SessionError::RuntimeStopped)?;
        reply_rx.await.map_err(|_| SessionError::RuntimeStopped)
    }
}

/// Spawn a session runtime on the current tokio runtime
pub fn spawn_session<S, E, P>(
    config: SessionConfig,
    store: S,
    engine: E,
    profiles: P,
) -> SessionHandle
where
    S: ConversationStore + 'static,
    E: GenerationEngine + 'static,
    P: ProfileRepository + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
    let (updates_tx, _) = broadcast::channel(config.update_buffer);
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

    let runtime = SessionRuntime::new(
        config,
        store,
        engine,
        profiles,
        command_rx,
        updates_tx.clone(),
        snapshot_tx,
    );
    tokio::spawn(runtime.run());

    SessionHandle {
        command_tx,
        updates_tx,
        snapshot_rx,
    }
}

//! Trait abstractions for the durable collaborators
//!
//! The session never owns persistent data. It reads and replaces whole
//! conversations through [`ConversationStore`] and looks up characters and
//! settings through [`ProfileRepository`], both injected at construction.

mod memory;

pub use memory::InMemoryStore;

use crate::engine::EventStream;
use crate::model::{AppSettings, Character, Conversation, ConversationSummary, DialogueStyle};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Message not found: {0}")]
    MessageNotFound(String),
    #[error("Character not found: {0}")]
    CharacterNotFound(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable conversation storage
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self) -> StoreResult<Conversation>;

    /// `None` if no conversation has this id
    async fn get_conversation(&self, id: &str) -> StoreResult<Option<Conversation>>;

    /// Newest first
    async fn list_conversations(&self) -> StoreResult<Vec<ConversationSummary>>;

    async fn delete_conversation(&self, id: &str) -> StoreResult<()>;

    async fn add_system_message(&self, conv_id: &str, content: &str) -> StoreResult<()>;

    async fn add_assistant_message(&self, conv_id: &str, content: &str) -> StoreResult<()>;

    async fn delete_message(&self, conv_id: &str, message_id: &str) -> StoreResult<()>;

    /// Replace a message's text in place
    async fn edit_message(&self, conv_id: &str, message_id: &str, content: &str)
        -> StoreResult<()>;

    /// Delete `message_id` and every later message. Returns the deleted ids.
    async fn rollback_to_message(&self, conv_id: &str, message_id: &str)
        -> StoreResult<Vec<String>>;

    async fn set_dialogue_style(&self, conv_id: &str, style: DialogueStyle) -> StoreResult<()>;

    /// Keep system messages and the first assistant greeting, reset the turn
    /// count and forget memory summaries
    async fn restart_story(&self, conv_id: &str) -> StoreResult<()>;

    /// Whether enough turns accumulated for a memory summarization pass
    async fn should_summarize_memory(&self, conv_id: &str) -> StoreResult<bool>;

    /// Run a summarization pass, reporting progress as stream events
    async fn summarize_memory(&self, conv_id: &str) -> StoreResult<EventStream>;
}

/// Characters, their conversation bindings, and user settings
#[async_trait]
pub trait ProfileRepository: Send + Sync {
    async fn load_settings(&self) -> StoreResult<AppSettings>;

    async fn save_settings(&self, settings: &AppSettings) -> StoreResult<()>;

    async fn get_character(&self, character_id: &str) -> StoreResult<Option<Character>>;

    /// Character bound to a conversation; `None` means no character
    async fn character_for_conversation(&self, conv_id: &str) -> StoreResult<Option<String>>;

    async fn bind_character(&self, conv_id: &str, character_id: Option<&str>) -> StoreResult<()>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: ConversationStore + ?Sized> ConversationStore for Arc<T> {
    async fn create_conversation(&self) -> StoreResult<Conversation> {
        (**self).create_conversation().await
    }

    async fn get_conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
        (**self).get_conversation(id).await
    }

    async fn list_conversations(&self) -> StoreResult<Vec<ConversationSummary>> {
        (**self).list_conversations().await
    }

    async fn delete_conversation(&self, id: &str) -> StoreResult<()> {
        (**self).delete_conversation(id).await
    }

    async fn add_system_message(&self, conv_id: &str, content: &str) -> StoreResult<()> {
        (**self).add_system_message(conv_id, content).await
    }

    async fn add_assistant_message(&self, conv_id: &str, content: &str) -> StoreResult<()> {
        (**self).add_assistant_message(conv_id, content).await
    }

    async fn delete_message(&self, conv_id: &str, message_id: &str) -> StoreResult<()> {
        (**self).delete_message(conv_id, message_id).await
    }

    async fn edit_message(
        &self,
        conv_id: &str,
        message_id: &str,
        content: &str,
    ) -> StoreResult<()> {
        (**self).edit_message(conv_id, message_id, content).await
    }

    async fn rollback_to_message(
        &self,
        conv_id: &str,
        message_id: &str,
    ) -> StoreResult<Vec<String>> {
        (**self).rollback_to_message(conv_id, message_id).await
    }

    async fn set_dialogue_style(&self, conv_id: &str, style: DialogueStyle) -> StoreResult<()> {
        (**self).set_dialogue_style(conv_id, style).await
    }

    async fn restart_story(&self, conv_id: &str) -> StoreResult<()> {
        (**self).restart_story(conv_id).await
    }

    async fn should_summarize_memory(&self, conv_id: &str) -> StoreResult<bool> {
        (**self).should_summarize_memory(conv_id).await
    }

    async fn summarize_memory(&self, conv_id: &str) -> StoreResult<EventStream> {
        (**self).summarize_memory(conv_id).await
    }
}

#[async_trait]
impl<T: ProfileRepository + ?Sized> ProfileRepository for Arc<T> {
    async fn load_settings(&self) -> StoreResult<AppSettings> {
        (**self).load_settings().await
    }

    async fn save_settings(&self, settings: &AppSettings) -> StoreResult<()> {
        (**self).save_settings(settings).await
    }

    async fn get_character(&self, character_id: &str) -> StoreResult<Option<Character>> {
        (**self).get_character(character_id).await
    }

    async fn character_for_conversation(&self, conv_id: &str) -> StoreResult<Option<String>> {
        (**self).character_for_conversation(conv_id).await
    }

    async fn bind_character(&self, conv_id: &str, character_id: Option<&str>) -> StoreResult<()> {
        (**self).bind_character(conv_id, character_id).await
    }
}

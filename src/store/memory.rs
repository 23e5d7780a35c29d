//! In-memory store
//!
//! Implements both store traits over process memory. It carries the same
//! rollback, title, ordering and summarization-cadence rules as the durable
//! store, which makes it suitable for the demo binary and for tests.

use super::{ConversationStore, ProfileRepository, StoreError, StoreResult};
use crate::engine::{EventStream, StreamEvent};
use crate::model::{
    AppSettings, Character, Conversation, ConversationSummary, DialogueStyle, Message,
    MessageType, Role,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Turns between memory summarization passes
pub const SUMMARIZE_INTERVAL: u32 = 10;

/// Characters of the first user message used as a conversation title
const TITLE_CHARS: usize = 20;

const DEFAULT_MODEL: &str = "glm-4.7";

/// A memory summary and the messages it was built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRecord {
    pub summary: String,
    pub covered_message_ids: Vec<String>,
}

#[derive(Default)]
struct Inner {
    conversations: HashMap<String, Conversation>,
    memories: HashMap<String, Vec<MemoryRecord>>,
    characters: HashMap<String, Character>,
    bindings: HashMap<String, String>,
    settings: AppSettings,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Storage("store lock poisoned".to_string()))
    }

    /// Register a character so it can be bound to conversations
    pub fn insert_character(&self, character: Character) -> StoreResult<()> {
        self.lock()?
            .characters
            .insert(character.id.clone(), character);
        Ok(())
    }

    /// Persist a message as-is, assigning an id if it has none
    pub fn append_message(&self, conv_id: &str, mut message: Message) -> StoreResult<Message> {
        let mut inner = self.lock()?;
        let conv = inner
            .conversations
            .get_mut(conv_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conv_id.to_string()))?;

        if message.id.is_empty() {
            message.id = uuid::Uuid::new_v4().to_string();
        }
        if conv.title.is_empty() && message.role == Role::User {
            conv.title = message.content.chars().take(TITLE_CHARS).collect();
        }
        conv.messages.push(message.clone());
        conv.updated_at = Utc::now();
        Ok(message)
    }

    /// Persist a user message the way the generation backend does
    pub fn append_user_message(&self, conv_id: &str, content: &str) -> StoreResult<Message> {
        let model = self.conversation_model(conv_id)?;
        self.append_message(conv_id, new_message(Role::User, content, &model))
    }

    /// Count a completed turn
    pub fn record_turn(&self, conv_id: &str) -> StoreResult<u32> {
        let mut inner = self.lock()?;
        let conv = inner
            .conversations
            .get_mut(conv_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conv_id.to_string()))?;
        conv.turn_count += 1;
        Ok(conv.turn_count)
    }

    /// Memory summaries currently held for a conversation
    pub fn memories(&self, conv_id: &str) -> StoreResult<Vec<MemoryRecord>> {
        Ok(self
            .lock()?
            .memories
            .get(conv_id)
            .cloned()
            .unwrap_or_default())
    }

    fn conversation_model(&self, conv_id: &str) -> StoreResult<String> {
        self.lock()?
            .conversations
            .get(conv_id)
            .map(|c| c.model.clone())
            .ok_or_else(|| StoreError::ConversationNotFound(conv_id.to_string()))
    }
}

fn new_message(role: Role, content: &str, model: &str) -> Message {
    Message {
        id: uuid::Uuid::new_v4().to_string(),
        role,
        content: content.to_string(),
        thinking_content: None,
        model: model.to_string(),
        created_at: Utc::now(),
        message_type: MessageType::default(),
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn create_conversation(&self) -> StoreResult<Conversation> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let conv = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            title: String::new(),
            messages: Vec::new(),
            model: inner.settings.chat_model.clone(),
            created_at: now,
            updated_at: now,
            dialogue_style: DialogueStyle::default(),
            turn_count: 0,
        };
        inner.conversations.insert(conv.id.clone(), conv.clone());
        Ok(conv)
    }

    async fn get_conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
        Ok(self.lock()?.conversations.get(id).cloned())
    }

    async fn list_conversations(&self) -> StoreResult<Vec<ConversationSummary>> {
        let mut summaries: Vec<ConversationSummary> = self
            .lock()?
            .conversations
            .values()
            .map(Conversation::summary)
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn delete_conversation(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.conversations.remove(id);
        inner.memories.remove(id);
        inner.bindings.remove(id);
        Ok(())
    }

    async fn add_system_message(&self, conv_id: &str, content: &str) -> StoreResult<()> {
        self.append_message(conv_id, new_message(Role::System, content, "system"))?;
        Ok(())
    }

    async fn add_assistant_message(&self, conv_id: &str, content: &str) -> StoreResult<()> {
        let model = self.conversation_model(conv_id)?;
        self.append_message(conv_id, new_message(Role::Assistant, content, &model))?;
        Ok(())
    }

    async fn delete_message(&self, conv_id: &str, message_id: &str) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let conv = inner
            .conversations
            .get_mut(conv_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conv_id.to_string()))?;
        let before = conv.messages.len();
        conv.messages.retain(|m| m.id != message_id);
        if conv.messages.len() == before {
            return Err(StoreError::MessageNotFound(message_id.to_string()));
        }
        conv.updated_at = Utc::now();
        Ok(())
    }

    async fn edit_message(
        &self,
        conv_id: &str,
        message_id: &str,
        content: &str,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let conv = inner
            .conversations
            .get_mut(conv_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conv_id.to_string()))?;
        let message = conv
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;

        let now = Utc::now();
        message.content = content.to_string();
        message.created_at = now;
        conv.updated_at = now;
        Ok(())
    }

    async fn rollback_to_message(
        &self,
        conv_id: &str,
        message_id: &str,
    ) -> StoreResult<Vec<String>> {
        let mut inner = self.lock()?;
        let conv = inner
            .conversations
            .get_mut(conv_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conv_id.to_string()))?;
        let pos = conv
            .position_of(message_id)
            .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;

        let deleted: Vec<String> = conv.messages.drain(pos..).map(|m| m.id).collect();
        conv.updated_at = Utc::now();

        if let Some(records) = inner.memories.get_mut(conv_id) {
            records.retain(|r| !r.covered_message_ids.iter().any(|id| deleted.contains(id)));
        }
        Ok(deleted)
    }

    async fn set_dialogue_style(&self, conv_id: &str, style: DialogueStyle) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let conv = inner
            .conversations
            .get_mut(conv_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conv_id.to_string()))?;
        conv.dialogue_style = style;
        conv.updated_at = Utc::now();
        Ok(())
    }

    async fn restart_story(&self, conv_id: &str) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let conv = inner
            .conversations
            .get_mut(conv_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conv_id.to_string()))?;

        let mut greeting_kept = false;
        conv.messages.retain(|m| match m.role {
            Role::System => true,
            Role::Assistant if !greeting_kept => {
                greeting_kept = true;
                true
            }
            _ => false,
        });
        conv.turn_count = 0;
        conv.updated_at = Utc::now();

        inner.memories.remove(conv_id);
        Ok(())
    }

    async fn should_summarize_memory(&self, conv_id: &str) -> StoreResult<bool> {
        let turns = self
            .lock()?
            .conversations
            .get(conv_id)
            .map_or(0, |c| c.turn_count);
        Ok(turns > 0 && turns % SUMMARIZE_INTERVAL == 0)
    }

    async fn summarize_memory(&self, conv_id: &str) -> StoreResult<EventStream> {
        let mut inner = self.lock()?;
        let conv = inner
            .conversations
            .get(conv_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conv_id.to_string()))?;

        let summary: String = conv
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" / ");
        let record = MemoryRecord {
            summary: summary.clone(),
            covered_message_ids: conv.messages.iter().map(|m| m.id.clone()).collect(),
        };
        inner
            .memories
            .entry(conv_id.to_string())
            .or_default()
            .push(record);

        let events = vec![Ok(StreamEvent::ContentDelta(summary)), Ok(StreamEvent::Done)];
        Ok(futures::stream::iter(events).boxed())
    }
}

#[async_trait]
impl ProfileRepository for InMemoryStore {
    async fn load_settings(&self) -> StoreResult<AppSettings> {
        Ok(self.lock()?.settings.clone())
    }

    async fn save_settings(&self, settings: &AppSettings) -> StoreResult<()> {
        self.lock()?.settings = settings.clone();
        Ok(())
    }

    async fn get_character(&self, character_id: &str) -> StoreResult<Option<Character>> {
        Ok(self.lock()?.characters.get(character_id).cloned())
    }

    async fn character_for_conversation(&self, conv_id: &str) -> StoreResult<Option<String>> {
        Ok(self.lock()?.bindings.get(conv_id).cloned())
    }

    async fn bind_character(&self, conv_id: &str, character_id: Option<&str>) -> StoreResult<()> {
        let mut inner = self.lock()?;
        match character_id {
            Some(id) => inner.bindings.insert(conv_id.to_string(), id.to_string()),
            None => inner.bindings.remove(conv_id),
        };
        Ok(())
    }
}

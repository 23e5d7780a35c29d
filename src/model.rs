//! Conversation data types shared by the session, the store and the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of characters of the last message shown in a conversation summary
pub const PREVIEW_CHARS: usize = 50;

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Shape of a message's text: spoken lines, described actions, or both
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Free-form text
    #[default]
    Mixed,
    /// Dialogue only
    Say,
    /// Actions only
    Do,
}

/// Dialogue style configured per conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DialogueStyle {
    Free,
    SayOnly,
    DoOnly,
    #[default]
    Mixed,
}

/// A single message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Empty until the store has persisted the message
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub thinking_content: Option<String>,
    pub model: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub message_type: MessageType,
}

impl Message {
    /// A user message shown optimistically before the store has it
    pub fn pending_user(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            role: Role::User,
            content: content.into(),
            thinking_content: None,
            model: model.into(),
            created_at: Utc::now(),
            message_type: MessageType::default(),
        }
    }

    pub fn is_persisted(&self) -> bool {
        !self.id.is_empty()
    }
}

/// A conversation as held by the durable store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    /// Chronological order
    pub messages: Vec<Message>,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub dialogue_style: DialogueStyle,
    #[serde(default)]
    pub turn_count: u32,
}

impl Conversation {
    pub fn last_role(&self) -> Option<Role> {
        self.messages.last().map(|m| m.role)
    }

    pub fn position_of(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == message_id)
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            last_message_preview: self
                .messages
                .last()
                .map(|m| m.content.chars().take(PREVIEW_CHARS).collect())
                .unwrap_or_default(),
            model: self.model.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Conversation list entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub last_message_preview: String,
    pub model: String,
    pub updated_at: DateTime<Utc>,
}

/// A persona a conversation can be bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub persona: String,
}

/// User preferences persisted by the profile repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    pub default_model: String,
    pub enable_thinking_by_default: bool,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_thinking_model")]
    pub thinking_model: String,
}

fn default_chat_model() -> String {
    "glm-4.7".to_string()
}

fn default_thinking_model() -> String {
    "glm-4-air".to_string()
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            default_model: default_chat_model(),
            enable_thinking_by_default: true,
            chat_model: default_chat_model(),
            thinking_model: default_thinking_model(),
        }
    }
}

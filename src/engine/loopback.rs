//! Loopback engine
//!
//! Generates replies locally by echoing the user's text back in word-sized
//! fragments. It persists through an [`InMemoryStore`] exactly where a
//! remote backend would: the user message before streaming starts, the
//! assistant reply just before `Done`.

use super::{EngineError, EventStream, GenerationEngine, GenerationRequest, StreamEvent};
use crate::model::{Message, MessageType, Role};
use crate::store::{ConversationStore, InMemoryStore};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const FRAGMENT_DELAY: Duration = Duration::from_millis(15);

pub struct LoopbackEngine {
    store: Arc<InMemoryStore>,
}

impl LoopbackEngine {
    pub fn new(store: Arc<InMemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl GenerationEngine for LoopbackEngine {
    async fn generate(&self, request: &GenerationRequest) -> Result<EventStream, EngineError> {
        let conv = self
            .store
            .get_conversation(&request.conversation_id)
            .await
            .map_err(|e| EngineError::unknown(e.to_string()))?
            .ok_or_else(|| {
                EngineError::invalid_request(format!(
                    "Unknown conversation {}",
                    request.conversation_id
                ))
            })?;

        let prompt = match &request.content {
            Some(text) => {
                self.store
                    .append_user_message(&request.conversation_id, text)
                    .map_err(|e| EngineError::unknown(e.to_string()))?;
                text.clone()
            }
            // Regenerate: answer the latest user message again
            None => conv
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone())
                .ok_or_else(|| EngineError::invalid_request("Nothing to regenerate"))?,
        };

        let reply = format!("You said: {prompt}");
        let thinking = request
            .enable_thinking
            .then(|| format!("The user wrote {} characters.", prompt.chars().count()));

        let (tx, rx) = mpsc::channel(16);
        let store = self.store.clone();
        let conv_id = request.conversation_id.clone();
        let model = request.model.clone();

        tokio::spawn(async move {
            if let Some(thinking) = &thinking {
                if tx.send(Ok(StreamEvent::ThinkingDelta(thinking.clone()))).await.is_err() {
                    return;
                }
            }
            for word in reply.split_inclusive(' ') {
                tokio::time::sleep(FRAGMENT_DELAY).await;
                if tx.send(Ok(StreamEvent::ContentDelta(word.to_string()))).await.is_err() {
                    tracing::debug!(conv_id = %conv_id, "Loopback reply abandoned by listener");
                    return;
                }
            }

            let message = Message {
                id: String::new(),
                role: Role::Assistant,
                content: reply,
                thinking_content: thinking,
                model,
                created_at: Utc::now(),
                message_type: MessageType::default(),
            };
            let persisted = store
                .append_message(&conv_id, message)
                .and_then(|_| store.record_turn(&conv_id));
            let last = match persisted {
                Ok(_) => StreamEvent::Done,
                Err(e) => StreamEvent::Error(format!("Failed to save reply: {e}")),
            };
            let _ = tx.send(Ok(last)).await;
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

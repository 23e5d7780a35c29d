//! Turn operations and conversation management
//!
//! Everything here runs inside the runtime task while the session is idle.
//! Pre-stream work (creating a conversation, rolling back, reloading) that
//! fails leaves the session idle with the error published; only once it
//! succeeds does the turn go through the state machine.

use super::executor::SessionRuntime;
use super::{CommandOutcome, SkipReason};
use crate::engine::{effective_thinking, resolve_chat_model, GenerationEngine, GenerationRequest};
use crate::model::{Character, Conversation, DialogueStyle, Message};
use crate::store::{ConversationStore, ProfileRepository, StoreError, StoreResult};
use std::sync::Arc;

impl<S, E, P> SessionRuntime<S, E, P>
where
    S: ConversationStore + 'static,
    E: GenerationEngine + 'static,
    P: ProfileRepository + 'static,
{
    pub(super) async fn send(&mut self, text: String) -> CommandOutcome {
        let text = text.trim();
        if text.is_empty() {
            return CommandOutcome::Skipped(SkipReason::EmptyInput);
        }

        let conv_id = match self.ensure_conversation().await {
            Ok(id) => id,
            Err(e) => return self.fail_before_stream("Could not start a conversation", &e),
        };
        self.start_user_turn(conv_id, text.to_string()).await
    }

    /// Re-ask without new text; the backend answers the stored tail
    pub(super) async fn retry(&mut self) -> CommandOutcome {
        let Some(conv_id) = self.conversation_id.clone() else {
            return CommandOutcome::Skipped(SkipReason::NoConversation);
        };
        self.start_tail_turn(conv_id).await
    }

    pub(super) async fn regenerate(&mut self, message_id: &str) -> CommandOutcome {
        let Some(conv_id) = self.conversation_id.clone() else {
            return CommandOutcome::Skipped(SkipReason::NoConversation);
        };
        if let Err(e) = self.rollback_and_reload(&conv_id, message_id).await {
            return self.fail_before_stream("Could not regenerate the reply", &e);
        }
        self.start_tail_turn(conv_id).await
    }

    pub(super) async fn edit_and_resend(&mut self, message_id: &str, text: String) -> CommandOutcome {
        let text = text.trim();
        if text.is_empty() {
            return CommandOutcome::Skipped(SkipReason::EmptyInput);
        }
        let Some(conv_id) = self.conversation_id.clone() else {
            return CommandOutcome::Skipped(SkipReason::NoConversation);
        };
        if let Err(e) = self.rollback_and_reload(&conv_id, message_id).await {
            return self.fail_before_stream("Could not edit the message", &e);
        }
        self.start_user_turn(conv_id, text.to_string()).await
    }

    pub(super) async fn rollback_to(&mut self, message_id: &str) -> CommandOutcome {
        let Some(conv_id) = self.conversation_id.clone() else {
            return CommandOutcome::Skipped(SkipReason::NoConversation);
        };
        if let Err(e) = self.rollback_and_reload(&conv_id, message_id).await {
            return self.fail_before_stream("Could not roll back the conversation", &e);
        }
        self.refresh_conversation_list().await;
        self.notify();
        CommandOutcome::Applied
    }

    async fn start_user_turn(&mut self, conv_id: String, text: String) -> CommandOutcome {
        let model = self.settings.default_model.clone();
        Arc::make_mut(&mut self.messages).push(Message::pending_user(text.as_str(), model));
        self.error = None;
        self.turn_input = Some(text.clone());
        let request = self.generation_request(conv_id, Some(text));
        self.begin_turn(request).await
    }

    async fn start_tail_turn(&mut self, conv_id: String) -> CommandOutcome {
        self.error = None;
        self.turn_input = None;
        let request = self.generation_request(conv_id, None);
        self.begin_turn(request).await
    }

    /// Resolve the selected model into what the engine is asked for. The
    /// selection decides whether thinking happens; the request always names
    /// a chat model.
    fn generation_request(&self, conversation_id: String, content: Option<String>) -> GenerationRequest {
        let selected = &self.settings.default_model;
        GenerationRequest {
            conversation_id,
            content,
            model: resolve_chat_model(selected, &self.settings),
            enable_thinking: effective_thinking(selected, self.settings.enable_thinking_by_default),
        }
    }

    /// Delete the message and everything after it, then replace the cache
    /// with the stored conversation
    async fn rollback_and_reload(&mut self, conv_id: &str, message_id: &str) -> StoreResult<()> {
        let deleted = self.store.rollback_to_message(conv_id, message_id).await?;
        tracing::info!(conv_id = %conv_id, message_id = %message_id, deleted = deleted.len(), "Rolled back conversation");
        self.reload(conv_id).await
    }

    async fn reload(&mut self, conv_id: &str) -> StoreResult<()> {
        let conversation = self
            .store
            .get_conversation(conv_id)
            .await?
            .ok_or_else(|| StoreError::ConversationNotFound(conv_id.to_string()))?;
        self.dialogue_style = conversation.dialogue_style;
        self.messages = Arc::new(conversation.messages);
        Ok(())
    }

    async fn ensure_conversation(&mut self) -> StoreResult<String> {
        if let Some(id) = &self.conversation_id {
            return Ok(id.clone());
        }
        self.start_conversation(self.character.clone()).await
    }

    /// Create a conversation and make it the open one. A conversation whose
    /// character could not be set up is removed again.
    async fn start_conversation(&mut self, character: Option<Character>) -> StoreResult<String> {
        let conversation = self.store.create_conversation().await?;
        let conv_id = conversation.id.clone();
        tracing::info!(
            conv_id = %conv_id,
            character_id = ?character.as_ref().map(|c| c.id.as_str()),
            "Created conversation"
        );

        let conversation = match &character {
            None => conversation,
            Some(character) => match self.seed_character(&conv_id, character).await {
                Ok(seeded) => seeded,
                Err(e) => {
                    if let Err(cleanup) = self.store.delete_conversation(&conv_id).await {
                        tracing::warn!(conv_id = %conv_id, error = %cleanup, "Failed to remove conversation");
                    }
                    return Err(e);
                }
            },
        };

        self.conversation_id = Some(conv_id.clone());
        self.dialogue_style = conversation.dialogue_style;
        self.messages = Arc::new(conversation.messages);
        self.character = character;
        Ok(conv_id)
    }

    /// Bind the character and store its persona as the system prompt
    async fn seed_character(
        &mut self,
        conv_id: &str,
        character: &Character,
    ) -> StoreResult<Conversation> {
        self.profiles
            .bind_character(conv_id, Some(&character.id))
            .await?;
        if !character.persona.trim().is_empty() {
            self.store
                .add_system_message(conv_id, &character.persona)
                .await?;
        }
        self.store
            .get_conversation(conv_id)
            .await?
            .ok_or_else(|| StoreError::ConversationNotFound(conv_id.to_string()))
    }

    fn fail_before_stream(&mut self, context: &str, error: &StoreError) -> CommandOutcome {
        let message = format!("{context}: {error}");
        tracing::warn!(error = %error, "{context}");
        self.turn_input = None;
        self.error = Some(message.clone());
        self.notify();
        CommandOutcome::Failed(message)
    }

    pub(super) async fn new_conversation(&mut self, character_id: Option<&str>) -> CommandOutcome {
        let character = match character_id {
            Some(id) => match self.profiles.get_character(id).await {
                Ok(Some(character)) => Some(character),
                Ok(None) => {
                    let e = StoreError::CharacterNotFound(id.to_string());
                    return self.fail_before_stream("Could not bind the character", &e);
                }
                Err(e) => return self.fail_before_stream("Could not bind the character", &e),
            },
            None => None,
        };

        if let Err(e) = self.start_conversation(character).await {
            return self.fail_before_stream("Could not create a conversation", &e);
        }
        self.error = None;
        self.last_failed_input = None;

        self.refresh_conversation_list().await;
        self.notify();
        CommandOutcome::Applied
    }

    pub(super) async fn open_conversation(&mut self, id: &str) -> CommandOutcome {
        let conversation = match self.store.get_conversation(id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                let e = StoreError::ConversationNotFound(id.to_string());
                return self.fail_before_stream("Could not open the conversation", &e);
            }
            Err(e) => return self.fail_before_stream("Could not open the conversation", &e),
        };

        self.character = match self.profiles.character_for_conversation(id).await {
            Ok(Some(character_id)) => self
                .profiles
                .get_character(&character_id)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Failed to load bound character");
                    None
                }),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to look up bound character");
                None
            }
        };

        self.conversation_id = Some(conversation.id);
        self.dialogue_style = conversation.dialogue_style;
        self.messages = Arc::new(conversation.messages);
        self.error = None;
        self.last_failed_input = None;
        self.notify();
        CommandOutcome::Applied
    }

    pub(super) async fn delete_conversation(&mut self, id: &str) -> CommandOutcome {
        if let Err(e) = self.store.delete_conversation(id).await {
            return self.fail_before_stream("Could not delete the conversation", &e);
        }
        tracing::info!(conv_id = %id, "Deleted conversation");

        if self.conversation_id.as_deref() == Some(id) {
            self.conversation_id = None;
            self.dialogue_style = DialogueStyle::default();
            self.messages = Arc::new(Vec::new());
            self.character = None;
            self.error = None;
            self.last_failed_input = None;
        }
        self.refresh_conversation_list().await;
        self.notify();
        CommandOutcome::Applied
    }

    /// Change a message's text in place; nothing is regenerated
    pub(super) async fn edit_message(&mut self, message_id: &str, text: String) -> CommandOutcome {
        let text = text.trim();
        if text.is_empty() {
            return CommandOutcome::Skipped(SkipReason::EmptyInput);
        }
        let Some(conv_id) = self.conversation_id.clone() else {
            return CommandOutcome::Skipped(SkipReason::NoConversation);
        };
        if let Err(e) = self.store.edit_message(&conv_id, message_id, text).await {
            return self.fail_before_stream("Could not edit the message", &e);
        }
        if let Err(e) = self.reload(&conv_id).await {
            return self.fail_before_stream("Could not reload the conversation", &e);
        }
        self.refresh_conversation_list().await;
        self.notify();
        CommandOutcome::Applied
    }

    /// Start the story over from the system prompt and the greeting
    pub(super) async fn restart_story(&mut self) -> CommandOutcome {
        let Some(conv_id) = self.conversation_id.clone() else {
            return CommandOutcome::Skipped(SkipReason::NoConversation);
        };
        if let Err(e) = self.store.restart_story(&conv_id).await {
            return self.fail_before_stream("Could not restart the story", &e);
        }
        tracing::info!(conv_id = %conv_id, "Restarted story");
        if let Err(e) = self.reload(&conv_id).await {
            return self.fail_before_stream("Could not reload the conversation", &e);
        }
        self.error = None;
        self.last_failed_input = None;
        self.refresh_conversation_list().await;
        self.notify();
        CommandOutcome::Applied
    }

    pub(super) async fn set_dialogue_style(&mut self, style: DialogueStyle) -> CommandOutcome {
        let Some(conv_id) = self.conversation_id.clone() else {
            return CommandOutcome::Skipped(SkipReason::NoConversation);
        };
        if let Err(e) = self.store.set_dialogue_style(&conv_id, style).await {
            return self.fail_before_stream("Could not change the dialogue style", &e);
        }
        self.dialogue_style = style;
        self.notify();
        CommandOutcome::Applied
    }

    /// With a conversation open the binding is stored; otherwise the
    /// character is remembered for the next conversation created by `send`
    pub(super) async fn bind_character(&mut self, character_id: Option<&str>) -> CommandOutcome {
        let result = match (&self.conversation_id.clone(), character_id) {
            (Some(conv_id), Some(character_id)) => self.attach_character(conv_id, character_id).await,
            (Some(conv_id), None) => match self.profiles.bind_character(conv_id, None).await {
                Ok(()) => {
                    self.character = None;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            (None, Some(character_id)) => match self.profiles.get_character(character_id).await {
                Ok(Some(character)) => {
                    self.character = Some(character);
                    Ok(())
                }
                Ok(None) => Err(StoreError::CharacterNotFound(character_id.to_string())),
                Err(e) => Err(e),
            },
            (None, None) => {
                self.character = None;
                Ok(())
            }
        };

        if let Err(e) = result {
            return self.fail_before_stream("Could not bind the character", &e);
        }
        self.notify();
        CommandOutcome::Applied
    }

    async fn attach_character(&mut self, conv_id: &str, character_id: &str) -> StoreResult<()> {
        let character = self
            .profiles
            .get_character(character_id)
            .await?
            .ok_or_else(|| StoreError::CharacterNotFound(character_id.to_string()))?;
        self.profiles.bind_character(conv_id, Some(character_id)).await?;
        self.character = Some(character);
        Ok(())
    }

    /// Persist settings; the in-memory change stands even if saving fails
    pub(super) async fn save_settings(&mut self) -> CommandOutcome {
        if let Err(e) = self.profiles.save_settings(&self.settings).await {
            tracing::warn!(error = %e, "Failed to save settings");
        }
        self.notify();
        CommandOutcome::Applied
    }
}

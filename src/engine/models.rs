//! Centralized model definitions
//!
//! The session only needs to know which models exist and how each one
//! treats thinking mode; everything else is the engine's business.

use crate::model::AppSettings;

/// How a model handles the thinking (reasoning) channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingSupport {
    /// Never emits thinking deltas
    Unsupported,
    /// Thinking is a per-request choice
    Optional,
    /// Reasoning model, always thinks
    Always,
}

/// Model definition with metadata
#[derive(Debug, Clone)]
pub struct ModelDef {
    /// User-facing model ID
    pub id: &'static str,
    /// Human-readable description
    pub description: &'static str,
    /// Context window size in tokens
    pub context_window: usize,
    pub max_output_tokens: usize,
    pub thinking: ThinkingSupport,
}

impl ModelDef {
    pub fn supports_thinking(&self) -> bool {
        self.thinking != ThinkingSupport::Unsupported
    }
}

/// Get all available model definitions
pub fn all_models() -> &'static [ModelDef] {
    &[
        ModelDef {
            id: "glm-4.7",
            description: "GLM-4.7 (chat + thinking)",
            context_window: 128_000,
            max_output_tokens: 131_072,
            thinking: ThinkingSupport::Optional,
        },
        ModelDef {
            id: "glm-4-air",
            description: "GLM-4-Air (deep reasoning)",
            context_window: 128_000,
            max_output_tokens: 4095,
            thinking: ThinkingSupport::Always,
        },
        ModelDef {
            id: "glm-4.7-flash",
            description: "GLM-4.7-Flash (fast)",
            context_window: 128_000,
            max_output_tokens: 131_072,
            thinking: ThinkingSupport::Unsupported,
        },
    ]
}

/// Look up a model definition by ID
pub fn get_model(id: &str) -> Option<&'static ModelDef> {
    all_models().iter().find(|m| m.id == id)
}

/// Thinking mode actually requested from the engine for `model`.
///
/// Unknown models keep the caller's choice.
pub fn effective_thinking(model: &str, requested: bool) -> bool {
    match get_model(model).map(|m| m.thinking) {
        Some(ThinkingSupport::Always) => true,
        Some(ThinkingSupport::Unsupported) => false,
        Some(ThinkingSupport::Optional) | None => requested,
    }
}

/// Model used for the chat reply.
///
/// The reasoning model only thinks inside the engine's two-model pipeline, so
/// selecting it (or nothing) falls back to the configured chat model.
pub fn resolve_chat_model(requested: &str, settings: &AppSettings) -> String {
    let requested = requested.trim();
    if requested.is_empty() || requested == settings.thinking_model {
        settings.chat_model.clone()
    } else {
        requested.to_string()
    }
}

//! Generation engine abstraction
//!
//! The engine turns a conversation id plus request parameters into a lazy,
//! finite sequence of [`StreamEvent`]s. Model selection and prompt building
//! happen behind this trait.

mod error;
mod loopback;
pub mod models;

pub use error::{EngineError, EngineErrorKind};
pub use loopback::LoopbackEngine;
pub use models::{all_models, effective_thinking, resolve_chat_model, ModelDef, ThinkingSupport};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// One event of a generation stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    ContentDelta(String),
    ThinkingDelta(String),
    Done,
    /// Business error from the engine; the stream may continue afterwards
    Error(String),
}

/// Stream returned by the engine. An `Err` item means the transport broke.
pub type EventStream = BoxStream<'static, Result<StreamEvent, EngineError>>;

/// Parameters for one generation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub conversation_id: String,
    /// New user text, or `None` to regenerate from the conversation tail
    pub content: Option<String>,
    pub model: String,
    pub enable_thinking: bool,
}

/// Common interface for generation backends
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Open a generation stream
    async fn generate(&self, request: &GenerationRequest) -> Result<EventStream, EngineError>;
}

#[async_trait]
impl<T: GenerationEngine + ?Sized> GenerationEngine for Arc<T> {
    async fn generate(&self, request: &GenerationRequest) -> Result<EventStream, EngineError> {
        (**self).generate(request).await
    }
}

/// Logging wrapper for generation engines
pub struct LoggingEngine {
    inner: Arc<dyn GenerationEngine>,
}

impl LoggingEngine {
    pub fn new(inner: Arc<dyn GenerationEngine>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl GenerationEngine for LoggingEngine {
    async fn generate(&self, request: &GenerationRequest) -> Result<EventStream, EngineError> {
        let start = Instant::now();
        let conv_id = request.conversation_id.clone();
        let model = request.model.clone();

        let stream = match self.inner.generate(request).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(
                    conv_id = %conv_id,
                    model = %model,
                    kind = e.kind.as_str(),
                    error = %e.message,
                    "Failed to open generation stream"
                );
                return Err(e);
            }
        };

        tracing::info!(
            conv_id = %conv_id,
            model = %model,
            regenerate = request.content.is_none(),
            thinking = request.enable_thinking,
            "Generation stream opened"
        );

        let mut fragments = 0usize;
        Ok(stream
            .inspect(move |item| match item {
                Ok(StreamEvent::ContentDelta(_) | StreamEvent::ThinkingDelta(_)) => fragments += 1,
                Ok(StreamEvent::Done) => tracing::info!(
                    conv_id = %conv_id,
                    model = %model,
                    duration_ms = %start.elapsed().as_millis(),
                    fragments,
                    "Generation completed"
                ),
                Ok(StreamEvent::Error(message)) => tracing::warn!(
                    conv_id = %conv_id,
                    model = %model,
                    error = %message,
                    "Generation reported an error"
                ),
                Err(e) => tracing::error!(
                    conv_id = %conv_id,
                    model = %model,
                    duration_ms = %start.elapsed().as_millis(),
                    kind = e.kind.as_str(),
                    error = %e.message,
                    "Generation stream failed"
                ),
            })
            .boxed())
    }
}

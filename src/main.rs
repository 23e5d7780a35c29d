//! Chat session demo
//!
//! Runs a session against the loopback engine and an in-memory store,
//! sending each command-line argument as a user message.

use chat_session::engine::{LoggingEngine, LoopbackEngine};
use chat_session::state_machine::SessionPhase;
use chat_session::store::InMemoryStore;
use chat_session::{spawn_session, CommandOutcome, SessionConfig};
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_session=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = SessionConfig::from_env();
    let mut inputs: Vec<String> = std::env::args().skip(1).collect();
    if inputs.is_empty() {
        inputs.push("hello".to_string());
    }

    let store = Arc::new(InMemoryStore::new());
    let engine = LoggingEngine::new(Arc::new(LoopbackEngine::new(store.clone())));
    let session = spawn_session(config, store.clone(), engine, store);

    for model in session.available_models() {
        tracing::info!(
            model = model.id,
            description = model.description,
            context_window = model.context_window,
            max_output_tokens = model.max_output_tokens,
            thinking = model.supports_thinking(),
            "Model available"
        );
    }

    // Print streaming progress as it is published
    let mut updates = BroadcastStream::new(session.subscribe());
    let printer = tokio::spawn(async move {
        while let Some(update) = updates.next().await {
            let Ok(snapshot) = update else {
                // Lagged; the next snapshot carries the full text anyway
                continue;
            };
            if snapshot.phase == SessionPhase::Streaming && !snapshot.content.is_empty() {
                println!("... {}", snapshot.content);
            }
        }
    });

    let mut settled = session.snapshot().settled_turns;
    for input in inputs {
        match session.send(input.as_str()).await? {
            CommandOutcome::Started => {}
            other => {
                tracing::warn!(input = %input, outcome = ?other, "Message not sent");
                continue;
            }
        }

        let mut watch = session.watch();
        let snapshot = watch
            .wait_for(|s| s.phase == SessionPhase::Idle && s.settled_turns > settled)
            .await?
            .clone();
        settled = snapshot.settled_turns;

        match &snapshot.error {
            Some(error) => println!("!! {error}"),
            None => println!("<< {}", snapshot.content),
        }
    }

    let transcript = session.snapshot();
    println!("{}", serde_json::to_string_pretty(transcript.messages.as_slice())?);

    session.shutdown().await?;
    printer.abort();
    Ok(())
}

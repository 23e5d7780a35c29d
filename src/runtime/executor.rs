//! Session runtime executor

use super::{Command, CommandOutcome, CommandRequest, SessionSnapshot, SkipReason};
use crate::aggregator::DeltaAggregator;
use crate::config::SessionConfig;
use crate::engine::{GenerationEngine, GenerationRequest, StreamEvent};
use crate::model::{AppSettings, Character, ConversationSummary, DialogueStyle, Message};
use crate::reconcile::FetchOutcome;
use crate::state_machine::{transition, Effect, Event, SessionState, TransitionError};
use crate::store::{ConversationStore, ProfileRepository};
use crate::throttle::ThrottleClock;
use crate::watchdog::StallWatchdog;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 64;

/// Session runtime generic over its store, engine and profile repository
pub struct SessionRuntime<S, E, P>
where
    S: ConversationStore + 'static,
    E: GenerationEngine + 'static,
    P: ProfileRepository + 'static,
{
    pub(super) config: SessionConfig,
    pub(super) state: SessionState,
    pub(super) store: Arc<S>,
    pub(super) engine: Arc<E>,
    pub(super) profiles: Arc<P>,
    pub(super) aggregator: DeltaAggregator,
    pub(super) throttle: ThrottleClock,
    pub(super) watchdog: StallWatchdog,
    /// Cancels the forwarding task of the open subscription
    pub(super) subscription: Option<CancellationToken>,
    pub(super) next_turn_id: u64,
    pub(super) error: Option<String>,
    pub(super) last_failed_input: Option<String>,
    /// User text of the turn in flight, if it carried any
    pub(super) turn_input: Option<String>,
    pub(super) conversation_id: Option<String>,
    pub(super) dialogue_style: DialogueStyle,
    pub(super) messages: Arc<Vec<Message>>,
    pub(super) conversations: Arc<Vec<ConversationSummary>>,
    pub(super) character: Option<Character>,
    pub(super) settings: AppSettings,
    pub(super) settled_turns: u64,
    event_rx: mpsc::Receiver<Event>,
    event_tx: mpsc::Sender<Event>,
    command_rx: mpsc::Receiver<CommandRequest>,
    updates_tx: broadcast::Sender<SessionSnapshot>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl<S, E, P> SessionRuntime<S, E, P>
where
    S: ConversationStore + 'static,
    E: GenerationEngine + 'static,
    P: ProfileRepository + 'static,
{
    pub(crate) fn new(
        config: SessionConfig,
        store: S,
        engine: E,
        profiles: P,
        command_rx: mpsc::Receiver<CommandRequest>,
        updates_tx: broadcast::Sender<SessionSnapshot>,
        snapshot_tx: watch::Sender<SessionSnapshot>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            throttle: ThrottleClock::new(config.throttle_period),
            watchdog: StallWatchdog::new(config.stall_timeout),
            config,
            state: SessionState::Idle,
            store: Arc::new(store),
            engine: Arc::new(engine),
            profiles: Arc::new(profiles),
            aggregator: DeltaAggregator::new(),
            subscription: None,
            next_turn_id: 1,
            error: None,
            last_failed_input: None,
            turn_input: None,
            conversation_id: None,
            dialogue_style: DialogueStyle::default(),
            messages: Arc::new(Vec::new()),
            conversations: Arc::new(Vec::new()),
            character: None,
            settings: AppSettings::default(),
            settled_turns: 0,
            event_rx,
            event_tx,
            command_rx,
            updates_tx,
            snapshot_tx,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(
            throttle_ms = %self.config.throttle_period.as_millis(),
            stall_timeout_secs = self.config.stall_timeout.as_secs(),
            "Starting session runtime"
        );

        match self.profiles.load_settings().await {
            Ok(settings) => self.settings = settings,
            Err(e) => tracing::warn!(error = %e, "Failed to load settings, using defaults"),
        }
        self.refresh_conversation_list().await;
        self.notify();

        loop {
            tokio::select! {
                biased;

                () = self.throttle.tick() => self.process_event(Event::ThrottleTick).await,
                () = self.watchdog.expired() => {
                    tracing::warn!(turn_id = ?self.state.turn_id(), "No stream activity before the stall timeout");
                    self.process_event(Event::WatchdogFired).await;
                }
                Some(event) = self.event_rx.recv() => self.process_event(event).await,
                request = self.command_rx.recv() => {
                    let Some(CommandRequest { command, reply }) = request else {
                        break;
                    };
                    if matches!(command, Command::Shutdown) {
                        let _ = reply.send(CommandOutcome::Applied);
                        break;
                    }
                    let outcome = self.handle_command(command).await;
                    let _ = reply.send(outcome);
                }
            }
        }

        if let Some(token) = self.subscription.take() {
            token.cancel();
        }
        self.throttle.stop();
        self.watchdog.disarm();
        tracing::info!(settled_turns = self.settled_turns, "Session runtime stopped");
    }

    async fn handle_command(&mut self, command: Command) -> CommandOutcome {
        if command.requires_idle() && !self.state.is_idle() {
            tracing::debug!(?command, phase = ?self.state.phase(), "Ignoring command while busy");
            return CommandOutcome::Skipped(SkipReason::Busy);
        }

        match command {
            Command::Send { text } => self.send(text).await,
            Command::Retry => self.retry().await,
            Command::Regenerate { message_id } => self.regenerate(&message_id).await,
            Command::EditAndResend { message_id, text } => {
                self.edit_and_resend(&message_id, text).await
            }
            Command::RollbackTo { message_id } => self.rollback_to(&message_id).await,
            Command::EditMessage { message_id, text } => {
                self.edit_message(&message_id, text).await
            }
            Command::RestartStory => self.restart_story().await,
            Command::ClearError => {
                self.error = None;
                self.notify();
                CommandOutcome::Applied
            }
            Command::NewConversation { character_id } => {
                self.new_conversation(character_id.as_deref()).await
            }
            Command::OpenConversation { id } => self.open_conversation(&id).await,
            Command::DeleteConversation { id } => self.delete_conversation(&id).await,
            Command::RefreshConversations => {
                self.refresh_conversation_list().await;
                self.notify();
                CommandOutcome::Applied
            }
            Command::SetDialogueStyle(style) => self.set_dialogue_style(style).await,
            Command::SetModel(model) => {
                self.settings.default_model = model;
                self.save_settings().await
            }
            Command::SetThinking(enabled) => {
                self.settings.enable_thinking_by_default = enabled;
                self.save_settings().await
            }
            Command::BindCharacter(character_id) => {
                self.bind_character(character_id.as_deref()).await
            }
            Command::Shutdown => CommandOutcome::Applied,
        }
    }

    /// Start a turn through the state machine. Turn operations call this once
    /// their pre-stream work is done.
    pub(super) async fn begin_turn(&mut self, request: GenerationRequest) -> CommandOutcome {
        let turn_id = self.next_turn_id;
        self.next_turn_id += 1;

        match transition(&self.state, Event::BeginTurn { turn_id, request }) {
            Ok(result) => {
                tracing::info!(turn_id, "Turn started");
                self.state = result.new_state;
                for effect in result.effects {
                    if let Some(event) = self.execute_effect(effect).await {
                        self.process_event(event).await;
                    }
                }
                CommandOutcome::Started
            }
            Err(TransitionError::Busy) => CommandOutcome::Skipped(SkipReason::Busy),
            Err(e) => CommandOutcome::Failed(e.to_string()),
        }
    }

    async fn process_event(&mut self, event: Event) {
        // Effects can generate follow-up events; handle them in a loop
        let mut events_to_process = vec![event];

        while let Some(current_event) = events_to_process.pop() {
            let result = match transition(&self.state, current_event) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, phase = ?self.state.phase(), "Rejected session event");
                    return;
                }
            };

            self.state = result.new_state;

            for effect in result.effects {
                if let Some(generated_event) = self.execute_effect(effect).await {
                    events_to_process.push(generated_event);
                }
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn execute_effect(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::CancelSubscription => {
                if let Some(token) = self.subscription.take() {
                    token.cancel();
                }
                None
            }

            Effect::ResetBuffers => {
                self.aggregator.reset();
                None
            }

            Effect::StartTimers => {
                self.throttle.start();
                self.watchdog.restart();
                None
            }

            Effect::NotifyObservers => {
                self.notify();
                None
            }

            Effect::Subscribe { turn_id, request } => {
                self.subscribe(turn_id, request);
                None
            }

            Effect::AppendContent(text) => {
                self.aggregator.append_content(&text);
                None
            }

            Effect::AppendThinking(text) => {
                self.aggregator.append_thinking(&text);
                None
            }

            Effect::RestartWatchdog => {
                self.watchdog.restart();
                None
            }

            Effect::FlushIfDirty => {
                if self.aggregator.take_dirty() {
                    self.notify();
                }
                None
            }

            Effect::ExitStreaming => {
                self.throttle.stop();
                self.watchdog.disarm();
                self.aggregator.take_dirty();
                self.notify();
                None
            }

            Effect::Reconcile { turn_id } => {
                let fetched = match &self.conversation_id {
                    Some(id) => match self.store.get_conversation(id).await {
                        Ok(Some(conversation)) => FetchOutcome::Loaded(conversation),
                        Ok(None) => FetchOutcome::Missing,
                        Err(e) => FetchOutcome::Failed(e.to_string()),
                    },
                    None => FetchOutcome::Missing,
                };
                if let FetchOutcome::Failed(message) = &fetched {
                    tracing::warn!(turn_id, error = %message, "Failed to reload conversation");
                }
                Some(Event::Reconciled { turn_id, fetched })
            }

            Effect::ApplyReconciliation {
                cause,
                conversation,
                error,
            } => {
                if let Some(conversation) = conversation {
                    self.dialogue_style = conversation.dialogue_style;
                    self.messages = Arc::new(conversation.messages);
                } else {
                    // An optimistic user message never outlives its turn
                    Arc::make_mut(&mut self.messages).retain(Message::is_persisted);
                }

                let input = self.turn_input.take();
                if error.is_some() {
                    if input.is_some() {
                        self.last_failed_input = input;
                    }
                } else {
                    self.last_failed_input = None;
                }
                self.error = error;
                self.settled_turns += 1;

                tracing::info!(
                    cause = cause.as_str(),
                    error = ?self.error,
                    messages = self.messages.len(),
                    "Turn settled"
                );

                self.refresh_conversation_list().await;
                None
            }

            Effect::SummarizeMemory => {
                if let Some(conv_id) = self.conversation_id.clone() {
                    spawn_memory_summary(self.store.clone(), conv_id);
                }
                None
            }
        }
    }

    /// Open the engine stream in a background task that forwards its items
    /// as turn-tagged events
    fn subscribe(&mut self, turn_id: u64, request: GenerationRequest) {
        let cancel_token = CancellationToken::new();
        self.subscription = Some(cancel_token.clone());

        let engine = self.engine.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let opened = tokio::select! {
                biased;
                () = cancel_token.cancelled() => return,
                opened = engine.generate(&request) => opened,
            };

            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = event_tx
                        .send(Event::StreamFailed {
                            turn_id,
                            message: e.message,
                        })
                        .await;
                    return;
                }
            };

            loop {
                let item = tokio::select! {
                    biased;
                    () = cancel_token.cancelled() => {
                        tracing::debug!(turn_id, "Subscription cancelled");
                        return;
                    }
                    item = stream.next() => item,
                };

                let (event, last) = match item {
                    Some(Ok(StreamEvent::ContentDelta(text))) => {
                        (Event::ContentDelta { turn_id, text }, false)
                    }
                    Some(Ok(StreamEvent::ThinkingDelta(text))) => {
                        (Event::ThinkingDelta { turn_id, text }, false)
                    }
                    Some(Ok(StreamEvent::Done)) => (Event::EngineDone { turn_id }, true),
                    Some(Ok(StreamEvent::Error(message))) => {
                        (Event::EngineError { turn_id, message }, false)
                    }
                    Some(Err(e)) => (
                        Event::StreamFailed {
                            turn_id,
                            message: e.message,
                        },
                        true,
                    ),
                    None => (Event::StreamClosed { turn_id }, true),
                };

                if event_tx.send(event).await.is_err() || last {
                    return;
                }
            }
        });
    }

    /// Publish the current state to both observer channels
    pub(super) fn notify(&self) {
        let snapshot = self.snapshot();
        // No receivers is fine
        let _ = self.updates_tx.send(snapshot.clone());
        self.snapshot_tx.send_replace(snapshot);
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.state.phase(),
            active: self.state.is_streaming(),
            content: self.aggregator.content().to_string(),
            thinking: self.aggregator.thinking().to_string(),
            error: self.error.clone(),
            last_failed_input: self.last_failed_input.clone(),
            conversations: self.conversations.clone(),
            conversation_id: self.conversation_id.clone(),
            dialogue_style: self.dialogue_style,
            messages: self.messages.clone(),
            character: self.character.clone(),
            model: self.settings.default_model.clone(),
            thinking_enabled: self.settings.enable_thinking_by_default,
            settled_turns: self.settled_turns,
        }
    }

    /// Best effort; a failed listing keeps the previous one
    pub(super) async fn refresh_conversation_list(&mut self) {
        match self.store.list_conversations().await {
            Ok(list) => self.conversations = Arc::new(list),
            Err(e) => tracing::warn!(error = %e, "Failed to list conversations"),
        }
    }
}

fn spawn_memory_summary<S: ConversationStore + 'static>(store: Arc<S>, conv_id: String) {
    tokio::spawn(async move {
        match store.should_summarize_memory(&conv_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::warn!(conv_id = %conv_id, error = %e, "Memory summary check failed");
                return;
            }
        }

        let mut events = match store.summarize_memory(&conv_id).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(conv_id = %conv_id, error = %e, "Memory summarization failed");
                return;
            }
        };

        while let Some(item) = events.next().await {
            match item {
                Ok(StreamEvent::Done) => {
                    tracing::info!(conv_id = %conv_id, "Memory summarized");
                    return;
                }
                Ok(StreamEvent::Error(message)) => {
                    tracing::warn!(conv_id = %conv_id, error = %message, "Memory summarization reported an error");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(conv_id = %conv_id, error = %e, "Memory summarization stream failed");
                    return;
                }
            }
        }
    });
}

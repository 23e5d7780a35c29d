//! Mock implementations for testing
//!
//! These mocks enable integration testing of the session runtime without a
//! real generation backend.

use super::{spawn_session, SessionHandle, SessionSnapshot};
use crate::config::SessionConfig;
use crate::engine::{EngineError, EventStream, GenerationEngine, GenerationRequest, StreamEvent};
use crate::model::{Conversation, ConversationSummary, DialogueStyle, Role};
use crate::store::{ConversationStore, InMemoryStore, StoreError, StoreResult};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

// ============================================================================
// Scripted Engine
// ============================================================================

/// One step of a scripted generation
#[derive(Debug, Clone)]
pub enum Step {
    Content(&'static str),
    Thinking(&'static str),
    /// Business error event
    Error(&'static str),
    /// Transport failure; ends the stream
    Fail(&'static str),
    Done,
    /// The backend stores the reply streamed so far
    PersistReply,
    Wait(Duration),
    /// Never produce anything else and never close
    Hang,
}

/// Engine that plays back queued scripts, persisting to an [`InMemoryStore`]
/// the way a real backend would
pub struct ScriptedEngine {
    store: Arc<InMemoryStore>,
    scripts: Mutex<VecDeque<Result<Vec<Step>, EngineError>>>,
    /// Record of all requests made
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedEngine {
    pub fn new(store: Arc<InMemoryStore>) -> Self {
        Self {
            store,
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self, steps: Vec<Step>) {
        self.scripts.lock().unwrap().push_back(Ok(steps));
    }

    /// Queue a reply that arrives in fragments, is stored, then completes
    pub fn queue_reply(&self, fragments: &[&'static str]) {
        let mut steps: Vec<Step> = fragments.iter().copied().map(Step::Content).collect();
        steps.push(Step::PersistReply);
        steps.push(Step::Done);
        self.queue(steps);
    }

    /// Queue a failure to open the stream at all
    pub fn queue_open_error(&self, error: EngineError) {
        self.scripts.lock().unwrap().push_back(Err(error));
    }

    pub fn recorded_requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationEngine for ScriptedEngine {
    async fn generate(&self, request: &GenerationRequest) -> Result<EventStream, EngineError> {
        self.requests.lock().unwrap().push(request.clone());
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(vec![Step::Done]))?;

        if let Some(text) = &request.content {
            self.store
                .append_user_message(&request.conversation_id, text)
                .map_err(|e| EngineError::unknown(e.to_string()))?;
        }

        let (tx, rx) = mpsc::channel(16);
        let store = self.store.clone();
        let conv_id = request.conversation_id.clone();

        tokio::spawn(async move {
            let mut reply = String::new();
            for step in steps {
                let item = match step {
                    Step::Content(text) => {
                        reply.push_str(text);
                        Ok(StreamEvent::ContentDelta(text.to_string()))
                    }
                    Step::Thinking(text) => Ok(StreamEvent::ThinkingDelta(text.to_string())),
                    Step::Error(message) => Ok(StreamEvent::Error(message.to_string())),
                    Step::Fail(message) => Err(EngineError::network(message)),
                    Step::Done => Ok(StreamEvent::Done),
                    Step::PersistReply => {
                        store.add_assistant_message(&conv_id, &reply).await.unwrap();
                        store.record_turn(&conv_id).unwrap();
                        continue;
                    }
                    Step::Wait(duration) => {
                        tokio::time::sleep(duration).await;
                        continue;
                    }
                    Step::Hang => {
                        // Keep the sender alive so the stream never closes
                        let _tx = tx;
                        std::future::pending::<()>().await;
                        return;
                    }
                };
                let is_failure = item.is_err();
                if tx.send(item).await.is_err() || is_failure {
                    return;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

// ============================================================================
// Flaky Store
// ============================================================================

/// Store wrapper whose operations can be made to fail on demand
pub struct FlakyStore {
    inner: Arc<InMemoryStore>,
    pub fail_rollback: AtomicBool,
    pub fail_reads: AtomicBool,
    /// Fails system message writes
    pub fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            fail_rollback: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    fn check(flag: &AtomicBool) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Storage("disk unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ConversationStore for FlakyStore {
    async fn create_conversation(&self) -> StoreResult<Conversation> {
        self.inner.create_conversation().await
    }

    async fn get_conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
        Self::check(&self.fail_reads)?;
        self.inner.get_conversation(id).await
    }

    async fn list_conversations(&self) -> StoreResult<Vec<ConversationSummary>> {
        self.inner.list_conversations().await
    }

    async fn delete_conversation(&self, id: &str) -> StoreResult<()> {
        self.inner.delete_conversation(id).await
    }

    async fn add_system_message(&self, conv_id: &str, content: &str) -> StoreResult<()> {
        Self::check(&self.fail_writes)?;
        self.inner.add_system_message(conv_id, content).await
    }

    async fn add_assistant_message(&self, conv_id: &str, content: &str) -> StoreResult<()> {
        self.inner.add_assistant_message(conv_id, content).await
    }

    async fn delete_message(&self, conv_id: &str, message_id: &str) -> StoreResult<()> {
        self.inner.delete_message(conv_id, message_id).await
    }

    async fn edit_message(
        &self,
        conv_id: &str,
        message_id: &str,
        content: &str,
    ) -> StoreResult<()> {
        self.inner.edit_message(conv_id, message_id, content).await
    }

    async fn rollback_to_message(
        &self,
        conv_id: &str,
        message_id: &str,
    ) -> StoreResult<Vec<String>> {
        Self::check(&self.fail_rollback)?;
        self.inner.rollback_to_message(conv_id, message_id).await
    }

    async fn set_dialogue_style(&self, conv_id: &str, style: DialogueStyle) -> StoreResult<()> {
        self.inner.set_dialogue_style(conv_id, style).await
    }

    async fn restart_story(&self, conv_id: &str) -> StoreResult<()> {
        self.inner.restart_story(conv_id).await
    }

    async fn should_summarize_memory(&self, conv_id: &str) -> StoreResult<bool> {
        self.inner.should_summarize_memory(conv_id).await
    }

    async fn summarize_memory(&self, conv_id: &str) -> StoreResult<EventStream> {
        self.inner.summarize_memory(conv_id).await
    }
}

// ============================================================================
// Test Session
// ============================================================================

/// A running session wired to mocks, plus direct access to them
pub struct TestSession {
    pub handle: SessionHandle,
    pub store: Arc<InMemoryStore>,
    pub flaky: Arc<FlakyStore>,
    pub engine: Arc<ScriptedEngine>,
}

impl TestSession {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let flaky = Arc::new(FlakyStore::new(store.clone()));
        let engine = Arc::new(ScriptedEngine::new(store.clone()));
        let handle = spawn_session(config, flaky.clone(), engine.clone(), store.clone());
        Self {
            handle,
            store,
            flaky,
            engine,
        }
    }

    /// Create a conversation directly in the store; returns its id and the
    /// ids of the seeded messages in order
    pub async fn seed_conversation(&self, messages: &[(Role, &str)]) -> (String, Vec<String>) {
        let conv = self.store.create_conversation().await.unwrap();
        for (role, content) in messages {
            match role {
                Role::System => self.store.add_system_message(&conv.id, content).await,
                Role::User => self.store.append_user_message(&conv.id, content).map(|_| ()),
                Role::Assistant => self.store.add_assistant_message(&conv.id, content).await,
            }
            .unwrap();
        }
        let stored = self.store.get_conversation(&conv.id).await.unwrap().unwrap();
        let ids = stored.messages.iter().map(|m| m.id.clone()).collect();
        (conv.id, ids)
    }

    /// Wait until the published snapshot satisfies `pred`
    pub async fn wait_for(
        &self,
        what: &str,
        pred: impl Fn(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        let mut rx = self.handle.watch();
        let wait = async {
            loop {
                {
                    let snapshot = rx.borrow_and_update();
                    if pred(&snapshot) {
                        return snapshot.clone();
                    }
                }
                rx.changed().await.expect("session runtime stopped");
            }
        };
        tokio::time::timeout(Duration::from_secs(3600), wait)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
    }

    /// Wait until `turns` turns have settled and the session is idle again
    pub async fn wait_settled(&self, turns: u64) -> SessionSnapshot {
        self.wait_for("turn to settle", |s| {
            s.phase == crate::state_machine::SessionPhase::Idle && s.settled_turns >= turns
        })
        .await
    }
}

/// Collect broadcast snapshots until one matches `stop` (inclusive)
pub async fn collect_until(
    rx: &mut tokio::sync::broadcast::Receiver<SessionSnapshot>,
    stop: impl Fn(&SessionSnapshot) -> bool,
) -> Vec<SessionSnapshot> {
    let mut seen = Vec::new();
    loop {
        let snapshot = tokio::time::timeout(Duration::from_secs(3600), rx.recv())
            .await
            .expect("timed out collecting snapshots")
            .expect("update channel closed");
        let done = stop(&snapshot);
        seen.push(snapshot);
        if done {
            return seen;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::model::Character;
    use crate::reconcile::{INTERRUPTED_MESSAGE, RELOAD_FAILED_MESSAGE};
    use crate::runtime::{CommandOutcome, SkipReason};
    use crate::state_machine::SessionPhase;
    use crate::store::ProfileRepository;

    fn exited(s: &SessionSnapshot) -> bool {
        s.phase == SessionPhase::Settling
    }

    #[tokio::test]
    async fn test_scripted_engine_persists_like_backend() {
        let store = Arc::new(InMemoryStore::new());
        let conv = store.create_conversation().await.unwrap();
        let engine = ScriptedEngine::new(store.clone());
        engine.queue_reply(&["Hi", "!"]);

        let request = GenerationRequest {
            conversation_id: conv.id.clone(),
            content: Some("hey".to_string()),
            model: "glm-4.7".to_string(),
            enable_thinking: false,
        };
        let events: Vec<_> = engine.generate(&request).await.unwrap().collect().await;
        assert_eq!(events.len(), 3);

        let stored = store.get_conversation(&conv.id).await.unwrap().unwrap();
        let contents: Vec<_> = stored.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hey", "Hi!"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_streams_and_settles() {
        let session = TestSession::new();
        session.engine.queue_reply(&["He", "llo", ""]);

        let outcome = session.handle.send("hello").await.unwrap();
        assert_eq!(outcome, CommandOutcome::Started);

        let snapshot = session.wait_settled(1).await;
        assert!(!snapshot.active);
        assert_eq!(snapshot.error, None);
        assert_eq!(snapshot.content, "Hello");
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[0].role, Role::User);
        assert_eq!(snapshot.messages[0].content, "hello");
        assert_eq!(snapshot.messages[1].role, Role::Assistant);
        assert_eq!(snapshot.messages[1].content, "Hello");
        assert!(snapshot.messages.iter().all(|m| m.is_persisted()));
        assert_eq!(snapshot.conversations.len(), 1);
        assert_eq!(snapshot.conversations[0].title, "hello");

        let requests = session.engine.recorded_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].content.as_deref(), Some("hello"));
        assert_eq!(requests[0].model, "glm-4.7");
        assert!(requests[0].enable_thinking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_message_shown_before_store_has_it() {
        let session = TestSession::new();
        session.engine.queue(vec![Step::Hang]);

        session.handle.send("  hi  ").await.unwrap();

        let snapshot = session.handle.snapshot();
        assert!(snapshot.active);
        assert_eq!(snapshot.phase, SessionPhase::Streaming);
        let last = snapshot.messages.last().unwrap();
        assert_eq!(last.content, "hi");
        assert!(!last.is_persisted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_while_streaming_are_ignored() {
        let session = TestSession::new();
        session.engine.queue(vec![Step::Hang]);

        assert!(session.handle.send("one").await.unwrap().is_started());
        let busy = CommandOutcome::Skipped(SkipReason::Busy);
        assert_eq!(session.handle.send("two").await.unwrap(), busy);
        assert_eq!(session.handle.retry().await.unwrap(), busy);
        assert_eq!(session.handle.regenerate("m").await.unwrap(), busy);
        assert_eq!(session.handle.edit_and_resend("m", "x").await.unwrap(), busy);
        assert_eq!(session.handle.rollback_to_message("m").await.unwrap(), busy);
        assert_eq!(session.handle.edit_message("m", "x").await.unwrap(), busy);
        assert_eq!(session.handle.restart_story().await.unwrap(), busy);
        assert_eq!(session.engine.recorded_requests().len(), 1);

        // Preferences are not tied to the turn
        assert_eq!(
            session.handle.set_thinking(false).await.unwrap(),
            CommandOutcome::Applied
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_input_is_skipped() {
        let session = TestSession::new();

        let outcome = session.handle.send("   ").await.unwrap();
        assert_eq!(outcome, CommandOutcome::Skipped(SkipReason::EmptyInput));
        assert!(session.engine.recorded_requests().is_empty());
        assert_eq!(
            session.handle.retry().await.unwrap(),
            CommandOutcome::Skipped(SkipReason::NoConversation)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_notifications_are_throttled() {
        let session = TestSession::new();
        let mut steps = Vec::new();
        for _ in 0..20 {
            steps.push(Step::Content("x"));
            steps.push(Step::Wait(Duration::from_millis(5)));
        }
        steps.push(Step::Done);
        session.engine.queue(steps);

        let mut rx = session.handle.subscribe();
        session.handle.send("go").await.unwrap();
        let seen = collect_until(&mut rx, exited).await;

        // ~100ms of streaming at one notification per 30ms, plus the entry one
        let streaming = seen
            .iter()
            .filter(|s| s.phase == SessionPhase::Streaming)
            .count();
        assert!(streaming >= 2, "got {streaming}");
        assert!(streaming <= 5, "got {streaming}");

        let last = seen.last().unwrap();
        assert!(!last.active);
        assert_eq!(last.content, "x".repeat(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragments_wait_for_the_next_tick() {
        let session = TestSession::new();
        session
            .engine
            .queue(vec![Step::Content("a"), Step::Content("b"), Step::Hang]);

        let mut rx = session.handle.subscribe();
        session.handle.send("go").await.unwrap();
        let seen = collect_until(&mut rx, exited).await;

        let streaming: Vec<_> = seen
            .iter()
            .filter(|s| s.phase == SessionPhase::Streaming)
            .map(|s| s.content.as_str())
            .collect();
        // Entry, then one tick carrying both fragments; idle ticks stay quiet
        assert_eq!(streaming, vec!["", "ab"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_flushes_unpublished_fragments() {
        let session = TestSession::new();
        session
            .engine
            .queue(vec![Step::Thinking("hmm"), Step::Content("a"), Step::Done]);

        let mut rx = session.handle.subscribe();
        session.handle.send("go").await.unwrap();
        let seen = collect_until(&mut rx, exited).await;

        let last = seen.last().unwrap();
        assert!(!last.active);
        assert_eq!(last.content, "a");
        assert_eq!(last.thinking, "hmm");
        assert!(seen
            .iter()
            .filter(|s| s.phase == SessionPhase::Streaming)
            .all(|s| s.content.is_empty() && s.thinking.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_without_stored_reply_is_an_interruption() {
        let session = TestSession::new();
        session.engine.queue(vec![Step::Content("par"), Step::Hang]);

        let start = tokio::time::Instant::now();
        session.handle.send("hi").await.unwrap();
        let snapshot = session.wait_settled(1).await;

        assert!(start.elapsed() >= Duration::from_secs(600));
        assert!(!snapshot.active);
        assert_eq!(snapshot.error.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert_eq!(snapshot.last_failed_input.as_deref(), Some("hi"));
        assert_eq!(snapshot.messages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_after_stored_reply_is_success() {
        let session = TestSession::new();
        session
            .engine
            .queue(vec![Step::Content("Hi"), Step::PersistReply, Step::Hang]);

        session.handle.send("hi").await.unwrap();
        let snapshot = session.wait_settled(1).await;

        assert_eq!(snapshot.error, None);
        assert_eq!(snapshot.last_failed_input, None);
        let last = snapshot.messages.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "Hi");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_timeout_from_config() {
        let config = SessionConfig {
            stall_timeout: Duration::from_secs(5),
            ..SessionConfig::default()
        };
        let session = TestSession::with_config(config);
        session.engine.queue(vec![Step::Hang]);

        let start = tokio::time::Instant::now();
        session.handle.send("hi").await.unwrap();
        session.wait_settled(1).await;
        assert!(start.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_close_without_reply_is_an_interruption() {
        let session = TestSession::new();
        session.engine.queue(vec![Step::Content("partial")]);

        session.handle.send("hi").await.unwrap();
        let snapshot = session.wait_settled(1).await;

        assert_eq!(snapshot.error.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert_eq!(snapshot.last_failed_input.as_deref(), Some("hi"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_close_after_stored_reply_is_success() {
        let session = TestSession::new();
        session.engine.queue(vec![
            Step::Content("Hel"),
            Step::Content("lo"),
            Step::PersistReply,
        ]);

        session.handle.send("hello").await.unwrap();
        let snapshot = session.wait_settled(1).await;

        assert_eq!(snapshot.error, None);
        assert_eq!(snapshot.messages.last().unwrap().content, "Hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_is_an_interruption() {
        let session = TestSession::new();
        session
            .engine
            .queue(vec![Step::Content("x"), Step::Fail("connection reset")]);

        session.handle.send("hi").await.unwrap();
        let snapshot = session.wait_settled(1).await;

        assert_eq!(snapshot.error.as_deref(), Some(INTERRUPTED_MESSAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_is_an_interruption() {
        let session = TestSession::new();
        session
            .engine
            .queue_open_error(EngineError::network("connection refused"));

        assert!(session.handle.send("hi").await.unwrap().is_started());
        let snapshot = session.wait_settled(1).await;

        assert_eq!(snapshot.error.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert_eq!(snapshot.last_failed_input.as_deref(), Some("hi"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_business_error_then_done() {
        let session = TestSession::new();
        session
            .engine
            .queue(vec![Step::Error("quota exceeded"), Step::Done]);

        session.handle.send("hi").await.unwrap();
        let snapshot = session.wait_settled(1).await;

        assert_eq!(snapshot.error.as_deref(), Some("quota exceeded"));
        assert_eq!(snapshot.last_failed_input.as_deref(), Some("hi"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_business_error_then_close() {
        let session = TestSession::new();
        session.engine.queue(vec![Step::Error("content filtered")]);

        session.handle.send("hi").await.unwrap();
        let snapshot = session.wait_settled(1).await;

        assert_eq!(snapshot.error.as_deref(), Some("content filtered"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_failure() {
        let session = TestSession::new();
        session.engine.queue(vec![Step::Error("overloaded"), Step::Done]);
        session.handle.send("hi").await.unwrap();
        session.wait_settled(1).await;

        session.engine.queue_reply(&["ok"]);
        assert!(session.handle.retry().await.unwrap().is_started());
        let snapshot = session.wait_settled(2).await;

        assert_eq!(snapshot.error, None);
        assert_eq!(snapshot.last_failed_input, None);
        let requests = session.engine.recorded_requests();
        assert_eq!(requests[1].content, None);
        // The user message from the first attempt stays; the reply follows it
        let contents: Vec<_> = snapshot.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hi", "ok"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_to_message() {
        let session = TestSession::new();
        let (conv_id, ids) = session
            .seed_conversation(&[
                (Role::System, "sys"),
                (Role::User, "u1"),
                (Role::Assistant, "a1"),
                (Role::User, "u2"),
                (Role::Assistant, "a2"),
            ])
            .await;
        session.handle.open_conversation(&conv_id).await.unwrap();

        let outcome = session.handle.rollback_to_message(&ids[3]).await.unwrap();
        assert_eq!(outcome, CommandOutcome::Applied);

        let snapshot = session.handle.snapshot();
        let kept: Vec<_> = snapshot.messages.iter().map(|m| m.id.clone()).collect();
        assert_eq!(kept, ids[..3].to_vec());
        assert!(snapshot.conversations.iter().any(|c| c.id == conv_id));
        assert!(session.engine.recorded_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_regenerate_replaces_reply() {
        let session = TestSession::new();
        let (conv_id, ids) = session
            .seed_conversation(&[
                (Role::System, "sys"),
                (Role::User, "question"),
                (Role::Assistant, "old answer"),
            ])
            .await;
        session.handle.open_conversation(&conv_id).await.unwrap();
        session.engine.queue_reply(&["new ", "answer"]);

        assert!(session.handle.regenerate(&ids[2]).await.unwrap().is_started());
        let snapshot = session.wait_settled(1).await;

        let requests = session.engine.recorded_requests();
        assert_eq!(requests[0].content, None);
        assert_eq!(snapshot.messages.len(), 3);
        assert_eq!(snapshot.messages[1].id, ids[1]);
        assert_eq!(snapshot.messages[2].content, "new answer");
        assert!(snapshot.messages.iter().all(|m| m.id != ids[2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_and_resend() {
        let session = TestSession::new();
        let (conv_id, ids) = session
            .seed_conversation(&[
                (Role::System, "sys"),
                (Role::User, "old text"),
                (Role::Assistant, "old answer"),
            ])
            .await;
        session.handle.open_conversation(&conv_id).await.unwrap();
        session.engine.queue_reply(&["fresh"]);

        let outcome = session.handle.edit_and_resend(&ids[1], "new text").await.unwrap();
        assert!(outcome.is_started());
        let snapshot = session.wait_settled(1).await;

        assert_eq!(snapshot.messages.len(), 3);
        assert_eq!(snapshot.messages[0].id, ids[0]);
        assert_eq!(snapshot.messages[1].role, Role::User);
        assert_eq!(snapshot.messages[1].content, "new text");
        assert_ne!(snapshot.messages[1].id, ids[1]);
        assert_eq!(snapshot.messages[2].content, "fresh");
        assert_eq!(
            session.engine.recorded_requests()[0].content.as_deref(),
            Some("new text")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_stream_failure_stays_idle() {
        let session = TestSession::new();
        let (conv_id, ids) = session
            .seed_conversation(&[(Role::User, "q"), (Role::Assistant, "a")])
            .await;
        session.handle.open_conversation(&conv_id).await.unwrap();
        session.flaky.fail_rollback.store(true, Ordering::SeqCst);

        let outcome = session.handle.regenerate(&ids[1]).await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Failed(_)));

        let snapshot = session.handle.snapshot();
        assert_eq!(snapshot.phase, SessionPhase::Idle);
        assert!(!snapshot.active);
        assert!(snapshot.error.is_some());
        assert_eq!(snapshot.messages.len(), 2);
        assert!(session.engine.recorded_requests().is_empty());

        session.handle.clear_error().await.unwrap();
        assert_eq!(session.handle.snapshot().error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_message_fails_before_stream() {
        let session = TestSession::new();
        let (conv_id, _) = session.seed_conversation(&[(Role::User, "q")]).await;
        session.handle.open_conversation(&conv_id).await.unwrap();

        let outcome = session.handle.edit_and_resend("nope", "x").await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Failed(_)));
        assert_eq!(session.handle.snapshot().phase, SessionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_failure_drops_unsaved_messages() {
        let session = TestSession::new();
        let (conv_id, ids) = session
            .seed_conversation(&[(Role::User, "q"), (Role::Assistant, "a")])
            .await;
        session.handle.open_conversation(&conv_id).await.unwrap();
        session.flaky.fail_reads.store(true, Ordering::SeqCst);
        session.engine.queue_reply(&["one back"]);
        session.engine.queue_reply(&["two back"]);

        session.handle.send("one").await.unwrap();
        session.wait_settled(1).await;
        session.handle.send("two").await.unwrap();
        let snapshot = session.wait_settled(2).await;

        assert_eq!(snapshot.error.as_deref(), Some(RELOAD_FAILED_MESSAGE));
        assert_eq!(snapshot.last_failed_input.as_deref(), Some("two"));
        // Stored messages stay cached; unsaved ones are gone
        let cached: Vec<_> = snapshot.messages.iter().map(|m| m.id.clone()).collect();
        assert_eq!(cached, ids);
        assert!(snapshot.messages.iter().all(|m| m.is_persisted()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_summarized_every_tenth_turn() {
        let session = TestSession::new();
        let (conv_id, _) = session.seed_conversation(&[]).await;
        for _ in 0..9 {
            session.store.record_turn(&conv_id).unwrap();
        }
        session.handle.open_conversation(&conv_id).await.unwrap();
        session.engine.queue_reply(&["reply"]);

        session.handle.send("tenth").await.unwrap();
        session.wait_settled(1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(session.store.memories(&conv_id).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_summary_after_failed_turn() {
        let session = TestSession::new();
        let (conv_id, _) = session.seed_conversation(&[]).await;
        for _ in 0..10 {
            session.store.record_turn(&conv_id).unwrap();
        }
        session.handle.open_conversation(&conv_id).await.unwrap();
        session.engine.queue(vec![Step::Fail("reset")]);

        session.handle.send("hi").await.unwrap();
        session.wait_settled(1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(session.store.memories(&conv_id).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_selection_resolved_per_turn() {
        let session = TestSession::new();

        session.handle.set_model("glm-4-air").await.unwrap();
        session.handle.set_thinking(false).await.unwrap();
        session.engine.queue_reply(&["a"]);
        session.handle.send("one").await.unwrap();
        let snapshot = session.wait_settled(1).await;
        assert_eq!(snapshot.model, "glm-4-air");

        session.handle.set_model("glm-4.7-flash").await.unwrap();
        session.handle.set_thinking(true).await.unwrap();
        session.engine.queue_reply(&["b"]);
        session.handle.send("two").await.unwrap();
        session.wait_settled(2).await;

        let requests = session.engine.recorded_requests();
        // The reasoning model always thinks behind the chat model
        assert_eq!(requests[0].model, "glm-4.7");
        assert!(requests[0].enable_thinking);
        assert_eq!(requests[1].model, "glm-4.7-flash");
        assert!(!requests[1].enable_thinking);

        let saved = session.store.load_settings().await.unwrap();
        assert_eq!(saved.default_model, "glm-4.7-flash");
        assert!(saved.enable_thinking_by_default);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conversation_management() {
        let session = TestSession::new();
        session
            .store
            .insert_character(Character {
                id: "bard".to_string(),
                name: "Bard".to_string(),
                persona: "Speaks in verse".to_string(),
            })
            .unwrap();

        let outcome = session
            .handle
            .new_conversation(Some("bard".to_string()))
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Applied);
        let first = session.handle.snapshot();
        let first_id = first.conversation_id.clone().unwrap();
        assert_eq!(first.character.as_ref().map(|c| c.name.as_str()), Some("Bard"));

        session
            .handle
            .set_dialogue_style(DialogueStyle::SayOnly)
            .await
            .unwrap();
        assert_eq!(session.handle.snapshot().dialogue_style, DialogueStyle::SayOnly);

        session.handle.new_conversation(None).await.unwrap();
        let second = session.handle.snapshot();
        assert_ne!(second.conversation_id.as_deref(), Some(first_id.as_str()));
        assert_eq!(second.character, None);
        assert_eq!(second.conversations.len(), 2);

        session.handle.open_conversation(&first_id).await.unwrap();
        let reopened = session.handle.snapshot();
        assert_eq!(reopened.dialogue_style, DialogueStyle::SayOnly);
        assert_eq!(reopened.character.map(|c| c.id), Some("bard".to_string()));

        session.handle.delete_conversation(&first_id).await.unwrap();
        let after = session.handle.snapshot();
        assert_eq!(after.conversation_id, None);
        assert!(after.messages.is_empty());
        assert_eq!(after.conversations.len(), 1);

        let missing = session.handle.open_conversation(&first_id).await.unwrap();
        assert!(matches!(missing, CommandOutcome::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_character_picked_before_first_message() {
        let session = TestSession::new();
        session
            .store
            .insert_character(Character {
                id: "sage".to_string(),
                name: "Sage".to_string(),
                persona: String::new(),
            })
            .unwrap();

        session
            .handle
            .bind_character(Some("sage".to_string()))
            .await
            .unwrap();
        session.engine.queue_reply(&["hello"]);
        session.handle.send("hi").await.unwrap();
        let snapshot = session.wait_settled(1).await;

        let conv_id = snapshot.conversation_id.unwrap();
        let bound = session.store.character_for_conversation(&conv_id).await.unwrap();
        assert_eq!(bound.as_deref(), Some("sage"));

        let unknown = session
            .handle
            .bind_character(Some("ghost".to_string()))
            .await
            .unwrap();
        assert!(matches!(unknown, CommandOutcome::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_conversation_seeds_persona() {
        let session = TestSession::new();
        session
            .store
            .insert_character(Character {
                id: "bard".to_string(),
                name: "Bard".to_string(),
                persona: "Speaks in verse".to_string(),
            })
            .unwrap();

        session
            .handle
            .new_conversation(Some("bard".to_string()))
            .await
            .unwrap();
        let snapshot = session.handle.snapshot();
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].role, Role::System);
        assert_eq!(snapshot.messages[0].content, "Speaks in verse");
        assert!(snapshot.messages[0].is_persisted());

        let missing = session
            .handle
            .new_conversation(Some("ghost".to_string()))
            .await
            .unwrap();
        assert!(matches!(missing, CommandOutcome::Failed(_)));
        assert_eq!(session.handle.snapshot().conversations.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_character_setup_leaves_no_conversation() {
        let session = TestSession::new();
        session
            .store
            .insert_character(Character {
                id: "bard".to_string(),
                name: "Bard".to_string(),
                persona: "Speaks in verse".to_string(),
            })
            .unwrap();
        session
            .handle
            .bind_character(Some("bard".to_string()))
            .await
            .unwrap();

        session.flaky.fail_writes.store(true, Ordering::SeqCst);
        let outcome = session.handle.send("hi").await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Failed(_)));
        let snapshot = session.handle.snapshot();
        assert_eq!(snapshot.phase, SessionPhase::Idle);
        assert_eq!(snapshot.conversation_id, None);
        assert!(session.store.list_conversations().await.unwrap().is_empty());

        session.flaky.fail_writes.store(false, Ordering::SeqCst);
        session.engine.queue_reply(&["Thee too"]);
        assert!(session.handle.send("hi").await.unwrap().is_started());
        let snapshot = session.wait_settled(1).await;

        assert_eq!(session.store.list_conversations().await.unwrap().len(), 1);
        let roles: Vec<_> = snapshot.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(snapshot.messages[0].content, "Speaks in verse");
        assert_eq!(snapshot.error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_message_in_place() {
        let session = TestSession::new();
        let (conv_id, ids) = session
            .seed_conversation(&[(Role::User, "typo"), (Role::Assistant, "a")])
            .await;
        session.handle.open_conversation(&conv_id).await.unwrap();

        let outcome = session.handle.edit_message(&ids[0], " fixed ").await.unwrap();
        assert_eq!(outcome, CommandOutcome::Applied);

        let snapshot = session.handle.snapshot();
        assert_eq!(snapshot.phase, SessionPhase::Idle);
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[0].id, ids[0]);
        assert_eq!(snapshot.messages[0].content, "fixed");
        assert_eq!(snapshot.messages[1].id, ids[1]);
        assert!(session.engine.recorded_requests().is_empty());

        assert_eq!(
            session.handle.edit_message(&ids[0], "  ").await.unwrap(),
            CommandOutcome::Skipped(SkipReason::EmptyInput)
        );
        let unknown = session.handle.edit_message("nope", "x").await.unwrap();
        assert!(matches!(unknown, CommandOutcome::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_story() {
        let session = TestSession::new();
        assert_eq!(
            session.handle.restart_story().await.unwrap(),
            CommandOutcome::Skipped(SkipReason::NoConversation)
        );

        let (conv_id, ids) = session
            .seed_conversation(&[
                (Role::System, "You are a bard"),
                (Role::Assistant, "Well met!"),
                (Role::User, "Sing"),
                (Role::Assistant, "La la"),
            ])
            .await;
        for _ in 0..3 {
            session.store.record_turn(&conv_id).unwrap();
        }
        session.handle.open_conversation(&conv_id).await.unwrap();

        let outcome = session.handle.restart_story().await.unwrap();
        assert_eq!(outcome, CommandOutcome::Applied);

        let kept: Vec<_> = session
            .handle
            .snapshot()
            .messages
            .iter()
            .map(|m| m.id.clone())
            .collect();
        assert_eq!(kept, ids[..2].to_vec());
        let stored = session.store.get_conversation(&conv_id).await.unwrap().unwrap();
        assert_eq!(stored.turn_count, 0);
    }

    #[tokio::test]
    async fn test_available_models() {
        let session = TestSession::new();
        let ids: Vec<_> = session.handle.available_models().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["glm-4.7", "glm-4-air", "glm-4.7-flash"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_runtime() {
        let session = TestSession::new();
        session.engine.queue(vec![Step::Hang]);
        session.handle.send("hi").await.unwrap();

        session.handle.shutdown().await.unwrap();
        let err = session.handle.send("again").await.unwrap_err();
        assert_eq!(err, SessionError::RuntimeStopped);
    }
}

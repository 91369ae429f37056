//! Stream Session
//!
//! The public engine: turns `send(text)` into a streamed assistant message.
//!
//! # Design Philosophy
//!
//! A session owns its conversation outright. Transports, the manager and the
//! buffer only move chunks; every mutation of messages, usage and error state
//! happens here, under one lock, and events fire after that lock is released.
//!
//! # Turn lifecycle
//!
//! ```text
//! send ──► Sending ──► Streaming ──► Idle      (done)
//!             │            │
//!             │            └──────► Error     (terminal failure)
//!             └── retry per RetryPolicy, only before content arrived
//! stop ──► Idle   (no error set, send resolves Err(Aborted))
//! ```
//!
//! Concurrent `send` calls are serialized: a second call waits for the
//! first to settle and appends its user message when its own turn starts.
//!
//! # Staleness
//!
//! Every turn carries a cancellation token and the session generation it
//! started in. `stop()` cancels the token and `reset()` bumps the
//! generation; chunk application checks both under the state lock, so a
//! stopped or reset turn can never touch the conversation again.

pub mod events;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryPolicy;
use crate::buffer::{BufferConfig, BufferStrategy, Completion, Received};
use crate::error::StreamError;
use crate::manager::{ManagedStream, ManagerConfig, ManagerStats, TransportManager};
use crate::messages::{Chunk, Message, MessageId, MessageRole, UsageStats};
use crate::persistence::ConversationStore;
use crate::tokens::{TokenCounter, TokenCounterKind};
use crate::transport::{StreamRequest, TransportConfig, TransportKind, TransportState};

use events::EventBus;
pub use events::{SessionEvent, Subscription};

// ============================================================================
// State & Configuration
// ============================================================================

/// Session state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// Ready for a send
    #[default]
    Idle,
    /// Request issued, nothing received yet
    Sending,
    /// Chunks arriving
    Streaming,
    /// Last turn failed; see `error()`
    Error,
}

impl StreamState {
    /// Whether a turn is in progress
    #[must_use]
    pub fn is_streaming(self) -> bool {
        matches!(self, Self::Sending | Self::Streaming)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Sending => "sending",
            Self::Streaming => "streaming",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Session configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Completion endpoint URL
    pub endpoint: String,
    /// Model passed through to the endpoint
    pub model: Option<String>,
    /// Sampling temperature passed through
    pub temperature: Option<f32>,
    /// Completion limit passed through
    pub max_tokens: Option<u32>,
    /// Sent as a leading system message on every request
    pub system_prompt: Option<String>,
    /// Request-level retry
    pub retry: RetryPolicy,
    /// Transport selection
    pub transport: TransportConfig,
    /// Reconnect, health and buffer settings
    pub manager: ManagerConfig,
    /// Client-side token estimator
    pub token_counter: TokenCounterKind,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/v1/chat/stream".to_string(),
            model: None,
            temperature: None,
            max_tokens: None,
            system_prompt: None,
            retry: RetryPolicy::default(),
            transport: TransportConfig::default(),
            manager: ManagerConfig::default(),
            token_counter: TokenCounterKind::default(),
        }
    }
}

impl SessionConfig {
    /// Config for an endpoint with defaults elsewhere
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Set the request retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the primary transport
    #[must_use]
    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        self.transport.kind = kind;
        self
    }

    /// Set the buffer
    #[must_use]
    pub fn with_buffer(mut self, buffer: BufferConfig) -> Self {
        self.manager.buffer = buffer;
        self
    }

    /// Set the system prompt
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Set the model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Per-session counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Turns started
    pub turns_started: u64,
    /// Turns that ended with `done`
    pub turns_completed: u64,
    /// Turns that ended in the error state
    pub turns_failed: u64,
    /// Turns ended by stop or timeout
    pub turns_stopped: u64,
    /// Request-level retries
    pub retries: u64,
    /// Chunks applied to the conversation
    pub chunks_received: u64,
    /// Chunks the buffer evicted
    pub evicted_chunks: u64,
    /// Buffered chunks discarded by stop
    pub flushed_chunks: u64,
    /// Estimated prompt tokens of the last request
    pub prompt_tokens_estimate: u64,
    /// Estimated completion tokens of the current or last turn
    pub completion_tokens_estimate: u64,
}

// ============================================================================
// Internal State
// ============================================================================

#[derive(Debug, Default)]
struct SessionData {
    messages: Vec<Message>,
    usage: UsageStats,
    error: Option<StreamError>,
    state: StreamState,
    /// Assistant message of the current turn
    in_flight: Option<MessageId>,
    stats: SessionStats,
}

impl SessionData {
    fn set_state(&mut self, to: StreamState, events: &mut Vec<SessionEvent>) {
        if self.state != to {
            events.push(SessionEvent::StateChanged {
                from: self.state,
                to,
            });
            self.state = to;
        }
    }

    fn in_flight_index(&self) -> Option<usize> {
        let id = self.in_flight.as_ref()?;
        self.messages.iter().rposition(|m| &m.id == id)
    }

    /// Index of the in-flight assistant message, creating it if absent
    fn assistant_index(&mut self) -> (usize, bool) {
        if let Some(index) = self.in_flight_index() {
            return (index, false);
        }
        let message = Message::assistant("");
        self.in_flight = Some(message.id.clone());
        self.messages.push(message);
        (self.messages.len() - 1, true)
    }
}

struct ActiveTurn {
    id: u64,
    cancel: CancellationToken,
    stream: Option<ManagedStream>,
    stop_reason: Option<StreamError>,
}

/// Why one attempt of a turn ended without `done`
struct TurnFailure {
    error: StreamError,
    /// Content reached the conversation before the failure
    delivered: bool,
}

impl TurnFailure {
    fn new(error: StreamError, delivered: bool) -> Self {
        Self { error, delivered }
    }
}

struct SessionInner {
    config: SessionConfig,
    data: RwLock<SessionData>,
    events: Arc<EventBus>,
    manager: TransportManager,
    send_lock: AsyncMutex<()>,
    turn: Mutex<Option<ActiveTurn>>,
    // Held while turn events are delivered; stop and reset wait on it
    emission: ReentrantMutex<()>,
    turn_seq: AtomicU64,
    generation: AtomicU64,
    destroyed: AtomicBool,
    store: RwLock<Option<Arc<dyn ConversationStore>>>,
    counter: Box<dyn TokenCounter>,
    lifetime: CancellationToken,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

// ============================================================================
// Stream Session
// ============================================================================

/// Streaming conversation engine
///
/// Cheap to clone; clones share the same conversation.
#[derive(Clone)]
pub struct StreamSession {
    inner: Arc<SessionInner>,
}

impl StreamSession {
    /// Create a session, building its transport pool from `config.transport`
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Transport` if no transport can be created.
    pub fn new(config: SessionConfig) -> Result<Self, StreamError> {
        let manager = TransportManager::new(&config.transport, config.manager.clone())?;
        Ok(Self::with_manager(config, manager))
    }

    /// Create a session around an existing manager
    ///
    /// Starts the health monitor when called inside a tokio runtime and
    /// `config.manager.health_check_interval_ms` is non-zero.
    #[must_use]
    pub fn with_manager(config: SessionConfig, manager: TransportManager) -> Self {
        let counter = config.token_counter.build();
        let interval = config.manager.health_check_interval();
        let inner = Arc::new(SessionInner {
            config,
            data: RwLock::new(SessionData::default()),
            events: Arc::new(EventBus::default()),
            manager,
            send_lock: AsyncMutex::new(()),
            turn: Mutex::new(None),
            emission: ReentrantMutex::new(()),
            turn_seq: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            store: RwLock::new(None),
            counter,
            lifetime: CancellationToken::new(),
        });

        if let Some(period) = interval {
            if tokio::runtime::Handle::try_current().is_ok() {
                spawn_health_monitor(&inner, period);
            }
        }

        tracing::debug!(
            endpoint = %inner.config.endpoint,
            transport = %inner.config.transport.kind,
            buffer = %inner.config.manager.buffer.strategy,
            "Session created"
        );
        Self { inner }
    }

    // ------------------------------------------------------------------------
    // Readable state
    // ------------------------------------------------------------------------

    /// Copy of the conversation
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.inner.data.read().messages.clone()
    }

    /// Number of messages
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.inner.data.read().messages.len()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.inner.data.read().state
    }

    /// Whether a turn is in progress
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.state().is_streaming()
    }

    /// Error of the last failed turn
    #[must_use]
    pub fn error(&self) -> Option<StreamError> {
        self.inner.data.read().error.clone()
    }

    /// Last provider-reported usage
    #[must_use]
    pub fn usage(&self) -> UsageStats {
        self.inner.data.read().usage
    }

    /// Session counters and token estimates
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.inner.data.read().stats
    }

    /// Transport pool counters
    #[must_use]
    pub fn manager_stats(&self) -> ManagerStats {
        self.inner.manager.stats()
    }

    /// State of the active (or primary) transport
    #[must_use]
    pub fn transport_state(&self) -> TransportState {
        self.inner.manager.state()
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Whether `destroy()` was called
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Number of registered listeners
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.events.len()
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Register a listener for every event
    pub fn subscribe(
        &self,
        listener: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.events.subscribe(Arc::new(listener))
    }

    /// Called with each appended token
    pub fn on_token(&self, f: impl Fn(&str) + Send + Sync + 'static) -> Subscription {
        self.subscribe(move |event| {
            if let SessionEvent::Token { text, .. } = event {
                f(text);
            }
        })
    }

    /// Called with each usage report
    pub fn on_cost(&self, f: impl Fn(&UsageStats) + Send + Sync + 'static) -> Subscription {
        self.subscribe(move |event| {
            if let SessionEvent::Cost(usage) = event {
                f(usage);
            }
        })
    }

    /// Called when a turn fails
    pub fn on_error(&self, f: impl Fn(&StreamError) + Send + Sync + 'static) -> Subscription {
        self.subscribe(move |event| {
            if let SessionEvent::Error(err) = event {
                f(err);
            }
        })
    }

    /// Called when a turn starts, with the user message id
    pub fn on_stream_start(&self, f: impl Fn(&MessageId) + Send + Sync + 'static) -> Subscription {
        self.subscribe(move |event| {
            if let SessionEvent::StreamStart { message_id } = event {
                f(message_id);
            }
        })
    }

    /// Called when a turn finishes cleanly
    pub fn on_stream_end(
        &self,
        f: impl Fn(Option<&MessageId>, &UsageStats) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(move |event| {
            if let SessionEvent::StreamEnd { message_id, usage } = event {
                f(message_id.as_ref(), usage);
            }
        })
    }

    /// Called after `reset()`
    pub fn on_reset(&self, f: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.subscribe(move |event| {
            if matches!(event, SessionEvent::Reset) {
                f();
            }
        })
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Attach a store; completed turns are saved to it
    pub fn attach_store(&self, store: Arc<dyn ConversationStore>) {
        *self.inner.store.write() = Some(store);
    }

    /// Replace the conversation with the stored one
    ///
    /// # Errors
    ///
    /// Fails if no store is attached, a turn is active, or the store fails.
    pub async fn load_conversation(&self) -> anyhow::Result<usize> {
        let store = self
            .inner
            .store
            .read()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no conversation store attached"))?;
        if self.is_streaming() {
            anyhow::bail!("cannot load a conversation while a turn is active");
        }

        let messages = store.load().await?;
        let count = messages.len();
        {
            let mut data = self.inner.data.write();
            data.messages = messages;
            data.in_flight = None;
        }
        tracing::debug!(count, "Conversation loaded");
        Ok(count)
    }

    async fn persist(&self, messages: &[Message]) {
        let store = self.inner.store.read().clone();
        if let Some(store) = store {
            if let Err(e) = store.save(messages).await {
                tracing::warn!(error = %e, "Failed to save conversation");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Send a user message and stream the reply
    ///
    /// Resolves when the turn settles. Partial assistant content stays in
    /// `messages()` even when the turn fails.
    ///
    /// # Errors
    ///
    /// - `StreamError::Destroyed` after `destroy()`
    /// - `StreamError::Aborted` if `stop()` cancelled the turn
    /// - the terminal error otherwise (also stored in `error()`)
    pub async fn send(&self, content: impl Into<String>) -> Result<(), StreamError> {
        self.send_inner(content.into(), None).await
    }

    /// [`send`](Self::send) with a time limit for the turn
    ///
    /// The limit starts when the turn starts (after any queued turn). On
    /// expiry the turn is stopped and resolves `Err(StreamError::Timeout)`.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send), plus `StreamError::Timeout`.
    pub async fn send_with_timeout(
        &self,
        content: impl Into<String>,
        limit: Duration,
    ) -> Result<(), StreamError> {
        self.send_inner(content.into(), Some(limit)).await
    }

    /// Re-send the most recent user message as a new turn
    ///
    /// Resolves immediately when there is no user message.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub async fn retry(&self) -> Result<(), StreamError> {
        self.ensure_alive()?;
        let last = self
            .inner
            .data
            .read()
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.clone());

        match last {
            Some(content) => self.send(content).await,
            None => Ok(()),
        }
    }

    /// Cancel the active turn
    ///
    /// Buffered chunks are discarded and the state becomes `Idle`. No token
    /// or cost event follows `Stopped`, also when called from a listener.
    /// No-op when nothing is in flight.
    pub fn stop(&self) {
        self.stop_turn(None, StreamError::Aborted);
    }

    /// Clear messages, usage, error and counters
    ///
    /// An in-flight turn is not cancelled, but nothing it delivers afterwards
    /// reaches the conversation.
    pub fn reset(&self) {
        if self.is_destroyed() {
            return;
        }
        self.inner.generation.fetch_add(1, Ordering::AcqRel);

        let _emitting = self.inner.emission.lock();
        let mut events = Vec::new();
        {
            let mut data = self.inner.data.write();
            let from = data.state;
            *data = SessionData::default();
            if from != StreamState::Idle {
                events.push(SessionEvent::StateChanged {
                    from,
                    to: StreamState::Idle,
                });
            }
        }
        events.push(SessionEvent::Reset);
        self.inner.events.emit_all(events);
        tracing::debug!("Session reset");
    }

    /// Stop, drop every listener and release the transports
    ///
    /// Idempotent. Nothing is emitted afterwards and later sends fail with
    /// `StreamError::Destroyed`.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();
        self.inner.events.close();
        self.inner.lifetime.cancel();
        self.inner.manager.shutdown();
        tracing::debug!("Session destroyed");
    }

    // ------------------------------------------------------------------------
    // Turn machinery
    // ------------------------------------------------------------------------

    fn ensure_alive(&self) -> Result<(), StreamError> {
        if self.is_destroyed() {
            Err(StreamError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn is_current(&self, generation: u64, cancel: &CancellationToken) -> bool {
        !cancel.is_cancelled() && self.inner.generation.load(Ordering::Acquire) == generation
    }

    async fn send_inner(&self, content: String, limit: Option<Duration>) -> Result<(), StreamError> {
        self.ensure_alive()?;
        let _turn_guard = match self.inner.send_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("Send queued behind active turn");
                self.inner.send_lock.lock().await
            }
        };
        self.ensure_alive()?;
        self.run_turn(content, limit).await
    }

    async fn run_turn(&self, content: String, limit: Option<Duration>) -> Result<(), StreamError> {
        let generation = self.inner.generation.load(Ordering::Acquire);
        let turn_id = self.inner.turn_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = self.inner.lifetime.child_token();
        *self.inner.turn.lock() = Some(ActiveTurn {
            id: turn_id,
            cancel: cancel.clone(),
            stream: None,
            stop_reason: None,
        });

        let user = Message::user(content);
        let user_id = user.id.clone();
        let mut events = vec![SessionEvent::MessageAdded(user.clone())];
        {
            let mut data = self.inner.data.write();
            data.messages.push(user);
            data.error = None;
            data.in_flight = None;
            data.stats.turns_started += 1;
            data.stats.completion_tokens_estimate = 0;
            data.set_state(StreamState::Sending, &mut events);
        }
        events.push(SessionEvent::StreamStart {
            message_id: user_id.clone(),
        });
        self.inner.events.emit_all(events);
        tracing::debug!(turn = turn_id, message_id = %user_id, "Turn started");

        let result = {
            let drive = self.drive(turn_id, generation, &cancel);
            tokio::pin!(drive);
            match limit {
                Some(limit) => match tokio::time::timeout(limit, &mut drive).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.stop_turn(Some(turn_id), StreamError::Timeout);
                        drive.await
                    }
                },
                None => drive.await,
            }
        };

        let stop_reason = {
            let mut turn = self.inner.turn.lock();
            match turn.as_ref() {
                Some(active) if active.id == turn_id => {
                    let reason = active.stop_reason.clone();
                    *turn = None;
                    reason
                }
                _ => None,
            }
        };

        self.finish_turn(turn_id, result, generation, &cancel, stop_reason)
            .await
    }

    async fn finish_turn(
        &self,
        turn_id: u64,
        result: Result<(), StreamError>,
        generation: u64,
        cancel: &CancellationToken,
        stop_reason: Option<StreamError>,
    ) -> Result<(), StreamError> {
        let mut events = Vec::new();

        match result {
            Ok(()) => {
                let snapshot = {
                    let mut data = self.inner.data.write();
                    if !self.is_current(generation, cancel) {
                        return Err(stop_reason.unwrap_or(StreamError::Aborted));
                    }
                    let message_id = data.in_flight.take();
                    data.stats.turns_completed += 1;
                    data.set_state(StreamState::Idle, &mut events);
                    events.push(SessionEvent::StreamEnd {
                        message_id,
                        usage: data.usage,
                    });
                    data.messages.clone()
                };
                self.inner.events.emit_all(events);
                tracing::info!(
                    turn = turn_id,
                    messages = snapshot.len(),
                    "Turn completed"
                );
                self.persist(&snapshot).await;
                Ok(())
            }
            Err(error) => {
                {
                    let mut data = self.inner.data.write();
                    if !self.is_current(generation, cancel) {
                        return Err(stop_reason.unwrap_or(StreamError::Aborted));
                    }
                    data.in_flight = None;
                    data.error = Some(error.clone());
                    data.stats.turns_failed += 1;
                    data.set_state(StreamState::Error, &mut events);
                }
                events.push(SessionEvent::Error(error.clone()));
                self.inner.events.emit_all(events);
                tracing::warn!(turn = turn_id, error = %error, "Turn failed");
                Err(error)
            }
        }
    }

    /// Open, consume and retry until the turn settles
    async fn drive(
        &self,
        turn_id: u64,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        let policy = &self.inner.config.retry;
        let mut attempt = 0u32;

        loop {
            let request = self.build_request();
            let opened = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(StreamError::Aborted),
                opened = self.inner.manager.open(request) => opened,
            };

            let failure = match opened {
                Ok(stream) => {
                    if !self.register_stream(turn_id, cancel, &stream) {
                        stream.cancel();
                        return Err(StreamError::Aborted);
                    }
                    self.set_state_if_current(StreamState::Streaming, generation, cancel);
                    match self.consume(&stream, generation, cancel).await {
                        Ok(()) => return Ok(()),
                        Err(failure) => failure,
                    }
                }
                Err(error) => TurnFailure::new(error, false),
            };

            if failure.delivered
                || !failure.error.is_retryable()
                || !policy.allows(attempt)
                || !self.is_current(generation, cancel)
            {
                return Err(failure.error);
            }

            attempt += 1;
            let mut delay = policy.delay_for(attempt);
            if let Some(after) = failure.error.retry_after() {
                delay = delay.max(after);
            }

            let mut events = Vec::new();
            {
                let mut data = self.inner.data.write();
                data.stats.retries += 1;
                data.set_state(StreamState::Sending, &mut events);
            }
            events.push(SessionEvent::Retrying { attempt, delay });
            self.inner.events.emit_all(events);
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure.error,
                "Retrying request"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(StreamError::Aborted),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Record the stream on the active turn so `stop()` can cancel it
    fn register_stream(&self, turn_id: u64, cancel: &CancellationToken, stream: &ManagedStream) -> bool {
        let mut turn = self.inner.turn.lock();
        match turn.as_mut() {
            Some(active) if active.id == turn_id && !cancel.is_cancelled() => {
                active.stream = Some(stream.clone());
                true
            }
            _ => false,
        }
    }

    fn set_state_if_current(&self, to: StreamState, generation: u64, cancel: &CancellationToken) {
        let mut events = Vec::new();
        {
            let mut data = self.inner.data.write();
            if !self.is_current(generation, cancel) {
                return;
            }
            data.set_state(to, &mut events);
        }
        self.inner.events.emit_all(events);
    }

    async fn consume(
        &self,
        stream: &ManagedStream,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<(), TurnFailure> {
        let mut delivered = false;

        loop {
            let received = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(TurnFailure::new(StreamError::Aborted, delivered));
                }
                received = stream.buffer().recv() => received,
            };

            let chunk = match received {
                Received::Chunk(item) => item.chunk,
                Received::Overflow { evicted, strategy } => {
                    self.report_overflow(evicted, strategy, generation, cancel);
                    continue;
                }
                Received::Finished(Completion::Clean) => return Ok(()),
                Received::Finished(Completion::Cancelled) => {
                    return Err(TurnFailure::new(StreamError::Aborted, delivered));
                }
                Received::Finished(Completion::Aborted(error)) => {
                    return Err(TurnFailure::new(error, delivered));
                }
            };

            match chunk {
                Chunk::Done => return Ok(()),
                Chunk::Error(message) => {
                    return Err(TurnFailure::new(StreamError::Remote(message), true));
                }
                chunk => {
                    let Some((events, content)) = self.apply_chunk(chunk, generation, cancel)
                    else {
                        stream.cancel();
                        return Err(TurnFailure::new(StreamError::Aborted, delivered));
                    };
                    delivered |= content;
                    if !self.emit_current(&events, generation, cancel) {
                        return Err(TurnFailure::new(StreamError::Aborted, delivered));
                    }
                }
            }
        }
    }

    /// Apply a chunk to the conversation
    ///
    /// Returns the events to emit and whether assistant content changed, or
    /// None if the turn is no longer current.
    fn apply_chunk(
        &self,
        chunk: Chunk,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Option<(Vec<SessionEvent>, bool)> {
        let mut guard = self.inner.data.write();
        if !self.is_current(generation, cancel) {
            return None;
        }
        let data = &mut *guard;
        data.stats.chunks_received += 1;

        let mut events = Vec::new();
        let mut content = false;

        match chunk {
            Chunk::Token(text) => {
                data.stats.completion_tokens_estimate += self.inner.counter.count(&text);
                let (index, created) = data.assistant_index();
                let message = &mut data.messages[index];
                message.append(&text);
                if created {
                    events.push(SessionEvent::MessageAdded(message.clone()));
                }
                events.push(SessionEvent::Token {
                    message_id: message.id.clone(),
                    text,
                });
                content = true;
            }
            Chunk::Usage(usage) => {
                data.usage = usage;
                events.push(SessionEvent::Cost(usage));
            }
            Chunk::ToolCallDelta {
                deltas,
                finish_reason,
            } => {
                let (index, created) = data.assistant_index();
                let message = &mut data.messages[index];
                let calls: Vec<_> = deltas
                    .iter()
                    .map(|delta| message.merge_tool_delta(delta).clone())
                    .collect();
                if finish_reason.is_some() {
                    message.finish_reason = finish_reason;
                }
                if created {
                    events.push(SessionEvent::MessageAdded(message.clone()));
                }
                let message_id = message.id.clone();
                events.extend(calls.into_iter().map(|call| SessionEvent::ToolCall {
                    message_id: message_id.clone(),
                    call,
                }));
                content = true;
            }
            Chunk::Restart => {
                data.stats.completion_tokens_estimate = 0;
                if let Some(index) = data.in_flight_index() {
                    let message = &mut data.messages[index];
                    message.clear_streamed();
                    events.push(SessionEvent::StreamRestarted {
                        message_id: message.id.clone(),
                    });
                    tracing::debug!(message_id = %message.id, "Upstream restarted, partial content cleared");
                }
            }
            Chunk::Done | Chunk::Error(_) => {}
        }

        Some((events, content))
    }

    fn report_overflow(
        &self,
        evicted: usize,
        strategy: BufferStrategy,
        generation: u64,
        cancel: &CancellationToken,
    ) {
        {
            let mut data = self.inner.data.write();
            if !self.is_current(generation, cancel) {
                return;
            }
            data.stats.evicted_chunks += evicted as u64;
        }
        tracing::debug!(evicted, strategy = %strategy, "Buffer evicted chunks");
        self.emit_current(
            &[SessionEvent::BufferOverflow { evicted, strategy }],
            generation,
            cancel,
        );
    }

    /// Deliver turn events while the turn is still current
    ///
    /// The check runs before every event, so a listener that stops or resets
    /// the session cuts the rest of the batch. Returns false if cut.
    fn emit_current(
        &self,
        events: &[SessionEvent],
        generation: u64,
        cancel: &CancellationToken,
    ) -> bool {
        let _emitting = self.inner.emission.lock();
        for event in events {
            if !self.is_current(generation, cancel) {
                return false;
            }
            self.inner.events.emit(event);
        }
        true
    }

    /// Cancel the active turn (only `turn_id` when given)
    fn stop_turn(&self, turn_id: Option<u64>, reason: StreamError) -> bool {
        let mut flushed = 0;
        {
            let mut turn = self.inner.turn.lock();
            let Some(active) = turn.as_mut() else {
                return false;
            };
            if turn_id.is_some_and(|id| id != active.id) || active.cancel.is_cancelled() {
                return false;
            }
            active.stop_reason = Some(reason.clone());
            active.cancel.cancel();
            if let Some(stream) = &active.stream {
                stream.cancel();
                flushed = stream.buffer().stats().flushed;
            }
        }

        // Wait out a batch another thread is delivering
        let _emitting = self.inner.emission.lock();
        let mut events = Vec::new();
        {
            let mut data = self.inner.data.write();
            data.in_flight = None;
            data.stats.turns_stopped += 1;
            data.stats.flushed_chunks += flushed;
            data.set_state(StreamState::Idle, &mut events);
        }
        events.push(SessionEvent::Stopped);
        self.inner.events.emit_all(events);
        tracing::info!(reason = %reason, "Turn stopped");
        true
    }

    fn build_request(&self) -> StreamRequest {
        let config = &self.inner.config;
        let mut messages = Vec::new();
        if let Some(ref prompt) = config.system_prompt {
            messages.push(Message::system(prompt.clone()));
        }
        {
            let data = self.inner.data.read();
            messages.extend(
                data.messages
                    .iter()
                    .filter(|m| {
                        !(m.role == MessageRole::Assistant
                            && m.content.is_empty()
                            && m.tool_calls.is_empty())
                    })
                    .cloned(),
            );
        }

        let estimate = messages
            .iter()
            .map(|m| self.inner.counter.count(&m.content))
            .sum();
        self.inner.data.write().stats.prompt_tokens_estimate = estimate;

        StreamRequest {
            endpoint: config.endpoint.clone(),
            messages,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            resume_from: None,
        }
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.inner.data.read();
        f.debug_struct("StreamSession")
            .field("state", &data.state)
            .field("messages", &data.messages.len())
            .field("usage", &data.usage)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

/// Periodic health checks for the session's transport pool
fn spawn_health_monitor(inner: &Arc<SessionInner>, period: Duration) {
    let weak = Arc::downgrade(inner);
    let lifetime = inner.lifetime.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = lifetime.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let recycled = inner.manager.run_health_checks().await;
            if recycled > 0 {
                tracing::debug!(recycled, "Health check recycled transports");
            }
        }
    });
}

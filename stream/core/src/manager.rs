//! Transport Manager
//!
//! Owns the transport pool for one session and turns a request into a
//! buffered chunk stream.
//!
//! # Responsibilities
//!
//! - Open: try each pool member in order (`[kind, failover...]`) and report
//!   failure only after a full pass
//! - Pump: move events from the open transport into the [`MessageBuffer`];
//!   a full `capacity` buffer suspends the pump, which stops reading the
//!   transport
//! - Reconnect: on a mid-stream transport fault, wait per the backoff policy
//!   and reopen. Resumable transports continue from the last event id;
//!   others re-issue the request and push a [`Chunk::Restart`] so the
//!   session can discard partial content
//! - Health: recycle idle transports that fail a health check or sit idle
//!   too long
//!
//! # Locking
//!
//! Each pool slot keeps its transport behind a `tokio::sync::Mutex`. The pump
//! holds it only across `open`/`close`; health checks use `try_lock` and
//! skip busy slots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryPolicy;
use crate::buffer::{BufferConfig, Completion, MessageBuffer};
use crate::error::{classify, StreamError, TransportError};
use crate::messages::Chunk;
use crate::transport::{
    create_pool, StateCell, StreamRequest, Transport, TransportConfig, TransportKind,
    TransportResult, TransportState,
};

// ============================================================================
// Configuration
// ============================================================================

/// Manager configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Reconnect policy for mid-stream faults
    pub reconnect: RetryPolicy,
    /// Health check period in milliseconds (0 = disabled)
    pub health_check_interval_ms: u64,
    /// Idle time after which a finished transport is recycled
    pub max_idle_ms: u64,
    /// Buffer used for each stream
    pub buffer: BufferConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconnect: RetryPolicy::default(),
            health_check_interval_ms: 30_000,
            max_idle_ms: 300_000,
            buffer: BufferConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Health check period, if enabled
    #[must_use]
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_ms > 0)
            .then(|| Duration::from_millis(self.health_check_interval_ms))
    }
}

/// Manager statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    /// Streams opened
    pub opens: u64,
    /// Individual transport open failures
    pub open_failures: u64,
    /// Opens served by a failover transport
    pub failovers: u64,
    /// Successful mid-stream reconnects
    pub reconnects: u64,
    /// Reconnects that replayed the request from the start
    pub restarts: u64,
    /// Transports recycled by health checks
    pub recycled: u64,
    /// Health checks that failed
    pub health_check_failures: u64,
}

// ============================================================================
// Pool Slot
// ============================================================================

struct Slot {
    kind: TransportKind,
    state: StateCell,
    transport: AsyncMutex<Box<dyn Transport>>,
}

impl Slot {
    fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            kind: transport.kind(),
            state: transport.state_cell().clone(),
            transport: AsyncMutex::new(transport),
        }
    }
}

/// Shared pieces the pump task needs
#[derive(Clone)]
struct PumpContext {
    slots: Arc<Vec<Arc<Slot>>>,
    policy: RetryPolicy,
    stats: Arc<Mutex<ManagerStats>>,
}

// ============================================================================
// Managed Stream
// ============================================================================

/// Handle to one buffered stream
#[derive(Clone, Debug)]
pub struct ManagedStream {
    buffer: Arc<MessageBuffer>,
    cancel: CancellationToken,
    kind: TransportKind,
}

impl ManagedStream {
    /// Buffer the session reads from
    #[must_use]
    pub fn buffer(&self) -> &Arc<MessageBuffer> {
        &self.buffer
    }

    /// Transport that opened the stream
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Stop the pump, close the transport and flush the buffer
    ///
    /// Chunks already buffered are discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.buffer.flush();
    }

    /// Whether [`cancel`](Self::cancel) was called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ============================================================================
// Transport Manager
// ============================================================================

/// Owns the transport pool for one session
pub struct TransportManager {
    config: ManagerConfig,
    ctx: PumpContext,
    active: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
    shut_down: AtomicBool,
}

impl TransportManager {
    /// Build a manager with a pool created from `transport`
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if no pool member can be created.
    pub fn new(transport: &TransportConfig, config: ManagerConfig) -> Result<Self, TransportError> {
        Ok(Self::with_transports(create_pool(transport)?, config))
    }

    /// Build a manager around existing transports (pool order = vec order)
    #[must_use]
    pub fn with_transports(transports: Vec<Box<dyn Transport>>, config: ManagerConfig) -> Self {
        let slots = transports
            .into_iter()
            .map(|t| Arc::new(Slot::new(t)))
            .collect();
        Self {
            ctx: PumpContext {
                slots: Arc::new(slots),
                policy: config.reconnect.clone(),
                stats: Arc::new(Mutex::new(ManagerStats::default())),
            },
            config,
            active: Mutex::new(None),
            shutdown: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        *self.ctx.stats.lock()
    }

    /// Kind and state of each pool member, in pool order
    #[must_use]
    pub fn states(&self) -> Vec<(TransportKind, TransportState)> {
        self.ctx
            .slots
            .iter()
            .map(|slot| (slot.kind, slot.state.get()))
            .collect()
    }

    /// State of the most relevant transport: the first active one, else the
    /// primary
    #[must_use]
    pub fn state(&self) -> TransportState {
        let states = self.states();
        states
            .iter()
            .map(|(_, s)| *s)
            .find(|s| s.is_active())
            .or_else(|| states.first().map(|(_, s)| *s))
            .unwrap_or_default()
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Open a buffered stream for `request`
    ///
    /// Any stream this manager was still pumping is cancelled first.
    ///
    /// # Errors
    ///
    /// - `StreamError::Destroyed` after shutdown
    /// - the classified open error of the last pool member tried. A
    ///   non-retryable HTTP status ends the pass early since every transport
    ///   talks to the same endpoint.
    pub async fn open(&self, request: StreamRequest) -> Result<ManagedStream, StreamError> {
        if self.is_shut_down() {
            return Err(StreamError::Destroyed);
        }
        if let Some(previous) = self.active.lock().take() {
            previous.cancel();
        }

        let (index, rx) = open_first(&self.ctx, 0, &request).await?;
        let slot = &self.ctx.slots[index];
        {
            let mut stats = self.ctx.stats.lock();
            stats.opens += 1;
            if index > 0 {
                stats.failovers += 1;
            }
        }
        tracing::info!(kind = %slot.kind, endpoint = %request.endpoint, "Stream opened");

        let buffer = Arc::new(MessageBuffer::new(&self.config.buffer));
        let cancel = self.shutdown.child_token();
        *self.active.lock() = Some(cancel.clone());

        let stream = ManagedStream {
            buffer: buffer.clone(),
            cancel: cancel.clone(),
            kind: slot.kind,
        };

        tokio::spawn(pump(self.ctx.clone(), index, rx, request, buffer, cancel));

        Ok(stream)
    }

    /// Check idle transports and recycle stale or unhealthy ones
    ///
    /// Busy transports are skipped. Returns how many were recycled.
    pub async fn run_health_checks(&self) -> usize {
        let max_idle = Duration::from_millis(self.config.max_idle_ms);
        let mut recycled = 0;

        for slot in self.ctx.slots.iter() {
            let Ok(mut transport) = slot.transport.try_lock() else {
                continue;
            };
            let state = transport.state();
            if state.is_active() || state == TransportState::Idle {
                continue;
            }

            let stale = transport.idle_for() > max_idle;
            let healthy = !stale && transport.health_check().await;
            if !healthy {
                if !stale {
                    self.ctx.stats.lock().health_check_failures += 1;
                }
                tracing::debug!(kind = %slot.kind, stale, "Recycling transport");
                transport.recycle();
                recycled += 1;
            }
        }

        if recycled > 0 {
            self.ctx.stats.lock().recycled += recycled as u64;
        }
        recycled
    }

    /// Cancel any stream and release every transport
    ///
    /// Idempotent. Transports busy in an open are closed by their pump once
    /// it observes the cancellation.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        if let Some(active) = self.active.lock().take() {
            active.cancel();
        }
        for slot in self.ctx.slots.iter() {
            if let Ok(mut transport) = slot.transport.try_lock() {
                transport.recycle();
            }
        }
        tracing::debug!("Transport manager shut down");
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("pool", &self.states())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Open / Pump / Reconnect
// ============================================================================

/// Open on the first pool member that accepts, starting at `start`
async fn open_first(
    ctx: &PumpContext,
    start: usize,
    request: &StreamRequest,
) -> Result<(usize, mpsc::Receiver<TransportResult>), StreamError> {
    let count = ctx.slots.len();
    let mut last_err = TransportError::InvalidState("empty transport pool".into());

    for offset in 0..count {
        let index = (start + offset) % count;
        let slot = &ctx.slots[index];
        let mut transport = slot.transport.lock().await;
        if transport.state() == TransportState::Failed {
            transport.recycle();
        }

        match transport.open(request).await {
            Ok(rx) => return Ok((index, rx)),
            Err(e) => {
                ctx.stats.lock().open_failures += 1;
                tracing::warn!(kind = %slot.kind, error = %e, "Transport open failed");
                let fatal = matches!(e, TransportError::HttpStatus { .. }) && !e.is_retryable();
                last_err = e;
                if fatal {
                    break;
                }
            }
        }
    }

    Err(classify(last_err))
}

async fn close_slot(slot: &Slot) {
    slot.transport.lock().await.close();
}

/// Move events from the transport into the buffer until the stream ends
async fn pump(
    ctx: PumpContext,
    mut index: usize,
    mut rx: mpsc::Receiver<TransportResult>,
    mut request: StreamRequest,
    buffer: Arc<MessageBuffer>,
    cancel: CancellationToken,
) {
    let mut last_event_id: Option<String> = None;
    let mut delivered = false;

    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                close_slot(&ctx.slots[index]).await;
                return;
            }
            item = rx.recv() => item,
        };

        let fault = match item {
            Some(Ok(event)) => {
                if event.event_id.is_some() {
                    last_event_id = event.event_id;
                }
                let terminal = event.chunk.is_terminal();
                let pushed = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(StreamError::Aborted),
                    pushed = buffer.push(event.chunk) => pushed,
                };
                if pushed.is_err() {
                    close_slot(&ctx.slots[index]).await;
                    return;
                }
                delivered = true;
                if terminal {
                    buffer.close(Completion::Clean);
                    return;
                }
                continue;
            }
            Some(Err(err)) => err,
            None => StreamError::Transport(TransportError::ConnectionClosed),
        };

        if !fault.is_retryable() {
            tracing::warn!(error = %fault, "Stream failed");
            buffer.close(Completion::Aborted(fault));
            return;
        }

        match reconnect(&ctx, index, &mut request, &last_event_id, delivered, &buffer, &cancel, fault)
            .await
        {
            Ok((new_index, new_rx)) => {
                index = new_index;
                rx = new_rx;
            }
            Err(StreamError::Aborted) if cancel.is_cancelled() => {
                close_slot(&ctx.slots[index]).await;
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Reconnect attempts exhausted");
                buffer.close(Completion::Aborted(e));
                return;
            }
        }
    }
}

/// Reconnect per the backoff policy after a mid-stream fault
#[allow(clippy::too_many_arguments)]
async fn reconnect(
    ctx: &PumpContext,
    index: usize,
    request: &mut StreamRequest,
    last_event_id: &Option<String>,
    delivered: bool,
    buffer: &MessageBuffer,
    cancel: &CancellationToken,
    fault: StreamError,
) -> Result<(usize, mpsc::Receiver<TransportResult>), StreamError> {
    let mut last_err = fault;
    let mut attempt = 0u32;

    while ctx.policy.allows(attempt) {
        attempt += 1;
        let delay = ctx.policy.delay_for(attempt);
        ctx.slots[index].state.set(TransportState::Reconnecting);
        tracing::info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %last_err,
            "Reconnecting stream"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(StreamError::Aborted),
            () = tokio::time::sleep(delay) => {}
        }

        let resumable = ctx.slots[index].transport.lock().await.supports_resume();
        request.resume_from = if resumable { last_event_id.clone() } else { None };
        let restart = delivered && request.resume_from.is_none();

        match open_first(ctx, index, request).await {
            Ok((new_index, rx)) => {
                {
                    let mut stats = ctx.stats.lock();
                    stats.reconnects += 1;
                    if restart {
                        stats.restarts += 1;
                    }
                }
                if restart {
                    buffer.push(Chunk::Restart).await?;
                }
                tracing::info!(attempt, resumed = !restart, "Stream reconnected");
                return Ok((new_index, rx));
            }
            Err(e) if e.is_retryable() => last_err = e,
            Err(e) => return Err(e),
        }
    }

    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Received;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    /// Scripted outcome of one open
    enum Script {
        Refuse(TransportError),
        Stream(Vec<TransportResult>),
    }

    struct FakeTransport {
        kind: TransportKind,
        resumable: bool,
        state: StateCell,
        scripts: VecDeque<Script>,
        requests: Arc<Mutex<Vec<StreamRequest>>>,
        healthy: bool,
    }

    impl FakeTransport {
        fn new(kind: TransportKind, scripts: Vec<Script>) -> Self {
            Self {
                kind,
                resumable: false,
                state: StateCell::new(),
                scripts: scripts.into(),
                requests: Arc::new(Mutex::new(Vec::new())),
                healthy: true,
            }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn state_cell(&self) -> &StateCell {
            &self.state
        }

        fn supports_resume(&self) -> bool {
            self.resumable
        }

        async fn open(
            &mut self,
            request: &StreamRequest,
        ) -> Result<mpsc::Receiver<TransportResult>, TransportError> {
            self.requests.lock().push(request.clone());
            match self.scripts.pop_front() {
                Some(Script::Refuse(e)) => {
                    self.state.set(TransportState::Failed);
                    Err(e)
                }
                Some(Script::Stream(items)) => {
                    self.state.set(TransportState::Open);
                    let (tx, rx) = mpsc::channel(items.len().max(1));
                    for item in items {
                        let _ = tx.try_send(item);
                    }
                    Ok(rx)
                }
                None => Err(TransportError::ConnectionFailed("script exhausted".into())),
            }
        }

        fn close(&mut self) {
            self.state.set(TransportState::Closed);
        }

        async fn health_check(&mut self) -> bool {
            self.healthy
        }

        fn idle_for(&self) -> Duration {
            Duration::ZERO
        }

        fn recycle(&mut self) {
            self.state.set(TransportState::Idle);
        }
    }

    fn ok(chunk: Chunk) -> TransportResult {
        Ok(crate::transport::TransportEvent::new(chunk))
    }

    fn with_id(chunk: Chunk, id: &str) -> TransportResult {
        Ok(crate::transport::TransportEvent {
            chunk,
            event_id: Some(id.into()),
        })
    }

    fn reset() -> TransportResult {
        Err(StreamError::Transport(TransportError::ReceiveFailed(
            "reset".into(),
        )))
    }

    fn fast_config(max_retries: u32) -> ManagerConfig {
        ManagerConfig {
            reconnect: RetryPolicy::exponential(max_retries, 1),
            ..Default::default()
        }
    }

    async fn collect(stream: &ManagedStream) -> (Vec<Chunk>, Completion) {
        let mut chunks = Vec::new();
        loop {
            match stream.buffer().recv().await {
                Received::Chunk(c) => chunks.push(c.chunk),
                Received::Overflow { .. } => {}
                Received::Finished(completion) => return (chunks, completion),
            }
        }
    }

    fn request() -> StreamRequest {
        StreamRequest::new("http://fake/chat", Vec::new())
    }

    #[tokio::test]
    async fn test_clean_stream() {
        let transport = FakeTransport::new(
            TransportKind::Sse,
            vec![Script::Stream(vec![ok(Chunk::Token("hi".into())), ok(Chunk::Done)])],
        );
        let manager = TransportManager::with_transports(vec![Box::new(transport)], fast_config(0));

        let stream = manager.open(request()).await.unwrap();
        let (chunks, completion) = collect(&stream).await;

        assert_eq!(chunks, vec![Chunk::Token("hi".into()), Chunk::Done]);
        assert_eq!(completion, Completion::Clean);
        assert_eq!(manager.stats().opens, 1);
    }

    #[tokio::test]
    async fn test_reconnect_restarts_non_resumable() {
        let transport = FakeTransport::new(
            TransportKind::HttpChunked,
            vec![
                Script::Stream(vec![ok(Chunk::Token("Hel".into())), reset()]),
                Script::Stream(vec![ok(Chunk::Token("Hello".into())), ok(Chunk::Done)]),
            ],
        );
        let manager = TransportManager::with_transports(vec![Box::new(transport)], fast_config(2));

        let stream = manager.open(request()).await.unwrap();
        let (chunks, completion) = collect(&stream).await;

        assert_eq!(
            chunks,
            vec![
                Chunk::Token("Hel".into()),
                Chunk::Restart,
                Chunk::Token("Hello".into()),
                Chunk::Done
            ]
        );
        assert_eq!(completion, Completion::Clean);
        assert_eq!(manager.stats().restarts, 1);
    }

    #[tokio::test]
    async fn test_reconnect_resumes_from_last_event_id() {
        let mut transport = FakeTransport::new(
            TransportKind::Sse,
            vec![
                Script::Stream(vec![with_id(Chunk::Token("a".into()), "7"), reset()]),
                Script::Stream(vec![ok(Chunk::Token("b".into())), ok(Chunk::Done)]),
            ],
        );
        transport.resumable = true;
        let requests = transport.requests.clone();
        let manager = TransportManager::with_transports(vec![Box::new(transport)], fast_config(2));

        let stream = manager.open(request()).await.unwrap();
        let (chunks, _) = collect(&stream).await;

        assert_eq!(
            chunks,
            vec![Chunk::Token("a".into()), Chunk::Token("b".into()), Chunk::Done]
        );
        let requests = requests.lock();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].resume_from.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_reconnects_exhausted_aborts() {
        let transport = FakeTransport::new(
            TransportKind::Sse,
            vec![
                Script::Stream(vec![ok(Chunk::Token("a".into())), reset()]),
                Script::Refuse(TransportError::ConnectionFailed("down".into())),
            ],
        );
        let manager = TransportManager::with_transports(vec![Box::new(transport)], fast_config(1));

        let stream = manager.open(request()).await.unwrap();
        let (chunks, completion) = collect(&stream).await;

        assert_eq!(chunks, vec![Chunk::Token("a".into())]);
        assert_eq!(
            completion,
            Completion::Aborted(StreamError::Transport(TransportError::ConnectionFailed(
                "down".into()
            )))
        );
    }

    #[tokio::test]
    async fn test_protocol_error_not_reconnected() {
        let transport = FakeTransport::new(
            TransportKind::Sse,
            vec![Script::Stream(vec![Err(StreamError::Protocol("junk".into()))])],
        );
        let manager = TransportManager::with_transports(vec![Box::new(transport)], fast_config(3));

        let stream = manager.open(request()).await.unwrap();
        let (_, completion) = collect(&stream).await;

        assert_eq!(
            completion,
            Completion::Aborted(StreamError::Protocol("junk".into()))
        );
        assert_eq!(manager.stats().reconnects, 0);
    }

    #[tokio::test]
    async fn test_open_fails_over() {
        let primary = FakeTransport::new(
            TransportKind::WebSocket,
            vec![Script::Refuse(TransportError::ConnectionFailed("no ws".into()))],
        );
        let backup = FakeTransport::new(
            TransportKind::Sse,
            vec![Script::Stream(vec![ok(Chunk::Done)])],
        );
        let manager = TransportManager::with_transports(
            vec![Box::new(primary), Box::new(backup)],
            fast_config(0),
        );

        let stream = manager.open(request()).await.unwrap();
        assert_eq!(stream.kind(), TransportKind::Sse);
        assert_eq!(manager.stats().failovers, 1);
    }

    #[tokio::test]
    async fn test_open_client_error_stops_pass() {
        let primary = FakeTransport::new(
            TransportKind::Sse,
            vec![Script::Refuse(TransportError::HttpStatus {
                status: 401,
                body: "no".into(),
                retry_after: None,
            })],
        );
        let backup = FakeTransport::new(
            TransportKind::HttpChunked,
            vec![Script::Stream(vec![ok(Chunk::Done)])],
        );
        let manager = TransportManager::with_transports(
            vec![Box::new(primary), Box::new(backup)],
            fast_config(0),
        );

        let err = manager.open(request()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_health_check_recycles_unhealthy() {
        let mut transport = FakeTransport::new(TransportKind::WebSocket, Vec::new());
        transport.healthy = false;
        transport.state.set(TransportState::Closed);
        let manager = TransportManager::with_transports(vec![Box::new(transport)], fast_config(0));

        assert_eq!(manager.run_health_checks().await, 1);
        assert_eq!(manager.state(), TransportState::Idle);
        assert_eq!(manager.stats().health_check_failures, 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let transport = FakeTransport::new(TransportKind::Sse, Vec::new());
        let manager = TransportManager::with_transports(vec![Box::new(transport)], fast_config(0));
        manager.shutdown();
        manager.shutdown();

        assert!(manager.is_shut_down());
        assert_eq!(manager.open(request()).await.unwrap_err(), StreamError::Destroyed);
    }
}

//! Message Buffer
//!
//! Sits between a transport (producer) and a session (consumer) so a slow
//! consumer cannot grow memory without bound.
//!
//! # Strategies
//!
//! - `Circular`: fixed ring; when full the newest chunk overwrites the
//!   oldest slot
//! - `Sliding`: keeps the latest N chunks in arrival order; overflow
//!   truncates from the front
//! - `Priority`: when full, evicts the lowest-ranked chunk (oldest on ties)
//! - `Capacity`: never evicts; `push` waits until the consumer drains or the
//!   buffer is flushed
//!
//! `done`, `error` and `restart` chunks are pinned: no strategy evicts them.
//! Every eviction is counted and surfaced to the consumer as
//! [`Received::Overflow`] before the next chunk.
//!
//! # Completion
//!
//! Once the producer calls [`close`](MessageBuffer::close) and the consumer
//! has drained everything, [`recv`](MessageBuffer::recv) reports how the
//! stream ended: cleanly, aborted by a fault, or cancelled by a flush.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::StreamError;
use crate::messages::Chunk;

// ============================================================================
// Configuration
// ============================================================================

/// Admission/eviction strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferStrategy {
    /// Fixed ring, newest overwrites oldest
    Circular,
    /// Most recent N in order, front truncation
    Sliding,
    /// Lowest-ranked chunk evicted first
    Priority,
    /// No eviction; producer waits (backpressure)
    #[default]
    Capacity,
}

impl BufferStrategy {
    /// Whether chunks can be lost under this strategy
    #[must_use]
    pub fn is_lossy(self) -> bool {
        !matches!(self, Self::Capacity)
    }

    /// Whether retained chunks keep strict arrival order
    #[must_use]
    pub fn preserves_order(self) -> bool {
        matches!(self, Self::Capacity | Self::Sliding)
    }
}

impl fmt::Display for BufferStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Circular => "circular",
            Self::Sliding => "sliding",
            Self::Priority => "priority",
            Self::Capacity => "capacity",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for BufferStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "circular" | "ring" => Ok(Self::Circular),
            "sliding" | "window" => Ok(Self::Sliding),
            "priority" => Ok(Self::Priority),
            "capacity" | "block" => Ok(Self::Capacity),
            other => Err(format!("unknown buffer strategy: {other}")),
        }
    }
}

/// Default ranking: terminal 3, usage and tool calls 2, tokens 1
#[must_use]
pub fn default_priority(chunk: &Chunk) -> u8 {
    match chunk {
        Chunk::Done | Chunk::Error(_) | Chunk::Restart => 3,
        Chunk::Usage(_) | Chunk::ToolCallDelta { .. } => 2,
        Chunk::Token(_) => 1,
    }
}

/// Ranking function for the priority strategy
#[derive(Clone)]
pub struct PriorityFn(Arc<dyn Fn(&Chunk) -> u8 + Send + Sync>);

impl PriorityFn {
    /// Wrap a ranking function (higher survives longer)
    pub fn new(f: impl Fn(&Chunk) -> u8 + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Rank a chunk
    #[must_use]
    pub fn rank(&self, chunk: &Chunk) -> u8 {
        (self.0)(chunk)
    }
}

impl Default for PriorityFn {
    fn default() -> Self {
        Self::new(default_priority)
    }
}

impl fmt::Debug for PriorityFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PriorityFn")
    }
}

/// Buffer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Strategy
    pub strategy: BufferStrategy,
    /// Maximum buffered chunks (pinned chunks may exceed it)
    pub capacity: usize,
    /// Ranking for the priority strategy
    #[serde(skip)]
    pub priority: PriorityFn,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            strategy: BufferStrategy::Capacity,
            capacity: 256,
            priority: PriorityFn::default(),
        }
    }
}

impl BufferConfig {
    /// Config for a strategy and capacity with the default ranking
    #[must_use]
    pub fn new(strategy: BufferStrategy, capacity: usize) -> Self {
        Self {
            strategy,
            capacity,
            ..Default::default()
        }
    }

    /// Replace the ranking function
    #[must_use]
    pub fn with_priority(mut self, f: impl Fn(&Chunk) -> u8 + Send + Sync + 'static) -> Self {
        self.priority = PriorityFn::new(f);
        self
    }
}

// ============================================================================
// Buffered Items
// ============================================================================

/// A chunk with its arrival sequence number and rank
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferedChunk {
    /// Monotonic per-buffer sequence
    pub seq: u64,
    /// Decoded chunk
    pub chunk: Chunk,
    /// Rank (meaningful for the priority strategy)
    pub priority: u8,
}

impl BufferedChunk {
    fn pinned(&self) -> bool {
        is_pinned(&self.chunk)
    }
}

fn is_pinned(chunk: &Chunk) -> bool {
    matches!(chunk, Chunk::Done | Chunk::Error(_) | Chunk::Restart)
}

/// How a closed buffer's stream ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Producer finished normally
    Clean,
    /// Producer gave up on a fault
    Aborted(StreamError),
    /// Flushed by stop/destroy; remaining chunks were discarded
    Cancelled,
}

/// Result of a read
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Received {
    /// Next chunk in delivery order
    Chunk(BufferedChunk),
    /// Chunks were evicted since the last read
    Overflow {
        /// Number evicted
        evicted: usize,
        /// Strategy that evicted them
        strategy: BufferStrategy,
    },
    /// Closed and drained
    Finished(Completion),
}

/// Buffer statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    /// Chunks accepted
    pub pushed: u64,
    /// Chunks handed to the consumer
    pub delivered: u64,
    /// Chunks evicted or refused by a lossy strategy
    pub evicted: u64,
    /// Chunks discarded by a flush
    pub flushed: u64,
    /// Pushes that had to wait for space
    pub blocked_pushes: u64,
    /// Most chunks held at once
    pub high_water: usize,
}

// ============================================================================
// Storage
// ============================================================================

/// Fixed-size ring with in-place overwrite
///
/// Pinned chunks may grow `slots` past `capacity`; the ring shrinks back once
/// the consumer has drained it below capacity.
#[derive(Debug)]
struct Ring {
    slots: Vec<Option<BufferedChunk>>,
    head: usize,
    len: usize,
    capacity: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
            head: 0,
            len: 0,
            capacity,
        }
    }

    fn index(&self, offset: usize) -> usize {
        (self.head + offset) % self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    fn push_back(&mut self, item: BufferedChunk) {
        if self.is_full() {
            // Only pinned chunks overflow a full ring
            self.linearize();
            self.slots.push(Some(item));
            self.len += 1;
            return;
        }
        let idx = self.index(self.len);
        self.slots[idx] = Some(item);
        self.len += 1;
    }

    fn pop_front(&mut self) -> Option<BufferedChunk> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        self.shrink();
        item
    }

    /// Drop the oldest unpinned entry and append `item` at the tail
    ///
    /// Entries older than the victim shift one slot forward so order is
    /// kept. Returns false (and leaves the ring alone) if every entry is
    /// pinned.
    fn overwrite_oldest(&mut self, item: BufferedChunk) -> bool {
        let victim = (0..self.len).find(|&offset| {
            self.slots[self.index(offset)]
                .as_ref()
                .is_some_and(|c| !c.pinned())
        });
        let Some(k) = victim else {
            return false;
        };

        let victim_idx = self.index(k);
        self.slots[victim_idx] = None;
        for offset in (0..k).rev() {
            let from = self.index(offset);
            let to = self.index(offset + 1);
            self.slots[to] = self.slots[from].take();
        }
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;

        // One slot past the live range is free now
        self.push_back(item);
        true
    }

    /// Move the live range to the front of `slots`, dropping free slots
    fn linearize(&mut self) {
        let n = self.slots.len();
        let mut items = Vec::with_capacity(n + 1);
        for offset in 0..self.len {
            items.push(self.slots[(self.head + offset) % n].take());
        }
        self.slots = items;
        self.head = 0;
    }

    fn shrink(&mut self) {
        if self.slots.len() > self.capacity && self.len <= self.capacity {
            self.linearize();
            self.slots.resize_with(self.capacity, || None);
        }
    }

    fn clear(&mut self) -> usize {
        let dropped = self.len;
        self.slots = std::iter::repeat_with(|| None).take(self.capacity).collect();
        self.head = 0;
        self.len = 0;
        dropped
    }
}

#[derive(Debug)]
enum Store {
    Ring(Ring),
    Queue(VecDeque<BufferedChunk>),
}

impl Store {
    fn len(&self) -> usize {
        match self {
            Self::Ring(ring) => ring.len,
            Self::Queue(queue) => queue.len(),
        }
    }

    fn pop_front(&mut self) -> Option<BufferedChunk> {
        match self {
            Self::Ring(ring) => ring.pop_front(),
            Self::Queue(queue) => queue.pop_front(),
        }
    }

    fn clear(&mut self) -> usize {
        match self {
            Self::Ring(ring) => ring.clear(),
            Self::Queue(queue) => {
                let n = queue.len();
                queue.clear();
                n
            }
        }
    }
}

#[derive(Debug)]
struct Inner {
    store: Store,
    next_seq: u64,
    closed: Option<Completion>,
    unreported: usize,
    stats: BufferStats,
}

/// What admission did with an incoming chunk
enum Admit {
    Stored,
    Evicted,
    Refused,
    Full,
}

// ============================================================================
// Message Buffer
// ============================================================================

/// Bounded chunk buffer between one producer and one consumer
///
/// Shared as `Arc<MessageBuffer>`. Never holds its lock across an await.
#[derive(Debug)]
pub struct MessageBuffer {
    strategy: BufferStrategy,
    capacity: usize,
    priority: PriorityFn,
    inner: Mutex<Inner>,
    not_empty: Notify,
    not_full: Notify,
}

impl MessageBuffer {
    /// Create a buffer (capacity is clamped to at least 1)
    #[must_use]
    pub fn new(config: &BufferConfig) -> Self {
        let capacity = config.capacity.max(1);
        let store = match config.strategy {
            BufferStrategy::Circular => Store::Ring(Ring::new(capacity)),
            _ => Store::Queue(VecDeque::with_capacity(capacity.min(1024))),
        };
        Self {
            strategy: config.strategy,
            capacity,
            priority: config.priority.clone(),
            inner: Mutex::new(Inner {
                store,
                next_seq: 0,
                closed: None,
                unreported: 0,
                stats: BufferStats::default(),
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Strategy in use
    #[must_use]
    pub fn strategy(&self) -> BufferStrategy {
        self.strategy
    }

    /// Configured capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Chunks currently buffered
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().store.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the producer side is closed (or the buffer flushed)
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }

    /// Snapshot of the statistics
    #[must_use]
    pub fn stats(&self) -> BufferStats {
        self.inner.lock().stats
    }

    /// Add a chunk
    ///
    /// Lossy strategies return immediately, evicting if needed. `Capacity`
    /// waits for space.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Aborted` if the buffer is closed or gets
    /// flushed while waiting.
    pub async fn push(&self, chunk: Chunk) -> Result<(), StreamError> {
        let mut waited = false;
        let priority = self.priority.rank(&chunk);
        let mut chunk = Some(chunk);

        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outcome = {
                let mut inner = self.inner.lock();
                if inner.closed.is_some() {
                    return Err(StreamError::Aborted);
                }
                let Some(c) = chunk.take() else {
                    return Err(StreamError::Aborted);
                };
                let item = BufferedChunk {
                    seq: inner.next_seq,
                    chunk: c,
                    priority,
                };
                let outcome = self.admit(&mut inner, item, &mut chunk);
                if !matches!(outcome, Admit::Full) {
                    inner.next_seq += 1;
                    if matches!(outcome, Admit::Stored | Admit::Evicted) {
                        inner.stats.pushed += 1;
                    }
                    if matches!(outcome, Admit::Evicted | Admit::Refused) {
                        inner.stats.evicted += 1;
                        inner.unreported += 1;
                    }
                    let len = inner.store.len();
                    inner.stats.high_water = inner.stats.high_water.max(len);
                } else if !waited {
                    inner.stats.blocked_pushes += 1;
                }
                outcome
            };

            match outcome {
                Admit::Full => {
                    waited = true;
                    notified.await;
                }
                Admit::Evicted | Admit::Refused => {
                    tracing::debug!(strategy = %self.strategy, "Buffer overflow, chunk evicted");
                    self.not_empty.notify_waiters();
                    return Ok(());
                }
                Admit::Stored => {
                    self.not_empty.notify_waiters();
                    return Ok(());
                }
            }
        }
    }

    /// Place `item` according to the strategy
    ///
    /// On `Full` the chunk is handed back through `giveback`.
    fn admit(
        &self,
        inner: &mut Inner,
        item: BufferedChunk,
        giveback: &mut Option<Chunk>,
    ) -> Admit {
        let full = inner.store.len() >= self.capacity;
        let pinned = item.pinned();

        match &mut inner.store {
            Store::Ring(ring) => {
                if !full {
                    ring.push_back(item);
                    return Admit::Stored;
                }
                if pinned {
                    if ring.overwrite_oldest(item.clone()) {
                        return Admit::Evicted;
                    }
                    ring.push_back(item);
                    return Admit::Stored;
                }
                if ring.overwrite_oldest(item) {
                    Admit::Evicted
                } else {
                    Admit::Refused
                }
            }
            Store::Queue(queue) => {
                if !full {
                    queue.push_back(item);
                    return Admit::Stored;
                }
                match self.strategy {
                    BufferStrategy::Capacity => {
                        *giveback = Some(item.chunk);
                        Admit::Full
                    }
                    BufferStrategy::Sliding => {
                        match queue.iter().position(|c| !c.pinned()) {
                            Some(pos) => {
                                queue.remove(pos);
                                queue.push_back(item);
                                Admit::Evicted
                            }
                            None if pinned => {
                                queue.push_back(item);
                                Admit::Stored
                            }
                            None => Admit::Refused,
                        }
                    }
                    BufferStrategy::Priority | BufferStrategy::Circular => {
                        // Lowest rank loses, oldest first on ties
                        let victim = queue
                            .iter()
                            .enumerate()
                            .filter(|(_, c)| !c.pinned())
                            .min_by_key(|(_, c)| (c.priority, c.seq))
                            .map(|(pos, c)| (pos, c.priority));

                        match victim {
                            Some((_, rank)) if !pinned && item.priority < rank => Admit::Refused,
                            Some((pos, _)) => {
                                queue.remove(pos);
                                queue.push_back(item);
                                Admit::Evicted
                            }
                            None if pinned => {
                                queue.push_back(item);
                                Admit::Stored
                            }
                            None => Admit::Refused,
                        }
                    }
                }
            }
        }
    }

    /// Wait for the next item
    ///
    /// Pending eviction reports come first, then chunks in delivery order,
    /// then the completion once the buffer is closed and drained.
    pub async fn recv(&self) -> Received {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(received) = self.try_recv() {
                return received;
            }
            notified.await;
        }
    }

    /// Non-waiting variant of [`recv`](Self::recv)
    #[must_use]
    pub fn try_recv(&self) -> Option<Received> {
        let received = {
            let mut inner = self.inner.lock();
            if matches!(inner.closed, Some(Completion::Cancelled)) {
                return Some(Received::Finished(Completion::Cancelled));
            }
            if inner.unreported > 0 {
                let evicted = std::mem::take(&mut inner.unreported);
                return Some(Received::Overflow {
                    evicted,
                    strategy: self.strategy,
                });
            }
            match inner.store.pop_front() {
                Some(item) => {
                    inner.stats.delivered += 1;
                    Received::Chunk(item)
                }
                None => return inner.closed.clone().map(Received::Finished),
            }
        };
        self.not_full.notify_waiters();
        Some(received)
    }

    /// Producer is done; buffered chunks stay readable
    ///
    /// The first completion wins.
    pub fn close(&self, completion: Completion) {
        {
            let mut inner = self.inner.lock();
            if inner.closed.is_none() {
                inner.closed = Some(completion);
            }
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Discard everything and wake both sides
    ///
    /// A producer blocked in `push` returns `Err(Aborted)`; the consumer
    /// sees `Finished(Cancelled)`.
    pub fn flush(&self) {
        {
            let mut inner = self.inner.lock();
            let dropped = inner.store.clear();
            inner.stats.flushed += dropped as u64;
            inner.unreported = 0;
            inner.closed = Some(Completion::Cancelled);
            if dropped > 0 {
                tracing::debug!(dropped, "Buffer flushed");
            }
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}

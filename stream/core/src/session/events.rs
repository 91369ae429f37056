//! Session Events
//!
//! A typed event union delivered to an ordered subscriber list. Subscribing
//! returns a [`Subscription`] whose [`dispose`](Subscription::dispose)
//! removes the listener.
//!
//! Listeners run on the session's task, after the session has released its
//! state lock, so a listener may read the session (`messages()`, `usage()`)
//! or call `stop()` without deadlocking.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffer::BufferStrategy;
use crate::error::StreamError;
use crate::messages::{Message, MessageId, ToolCall, UsageStats};

use super::StreamState;

/// Everything a session reports
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Session state changed
    StateChanged {
        /// Previous state
        from: StreamState,
        /// New state
        to: StreamState,
    },
    /// A message joined the conversation (user on send, assistant on its
    /// first chunk)
    MessageAdded(Message),
    /// A turn started
    StreamStart {
        /// The user message that started it
        message_id: MessageId,
    },
    /// Text appended to the assistant message
    Token {
        /// Assistant message
        message_id: MessageId,
        /// Appended text
        text: String,
    },
    /// A tool call was created or extended
    ToolCall {
        /// Assistant message
        message_id: MessageId,
        /// Call as assembled so far
        call: ToolCall,
    },
    /// Usage replaced by a provider report
    Cost(UsageStats),
    /// A turn finished cleanly
    StreamEnd {
        /// Assistant message, if any content arrived
        message_id: Option<MessageId>,
        /// Usage at the end of the turn
        usage: UsageStats,
    },
    /// A turn failed
    Error(StreamError),
    /// A failed attempt will be retried after `delay`
    Retrying {
        /// Retry number (1-based)
        attempt: u32,
        /// Wait before the retry
        delay: Duration,
    },
    /// The active turn was stopped by the caller
    Stopped,
    /// The buffer evicted chunks
    BufferOverflow {
        /// Number evicted since the last report
        evicted: usize,
        /// Strategy that evicted them
        strategy: BufferStrategy,
    },
    /// Upstream replayed from scratch; the assistant message was cleared
    StreamRestarted {
        /// Assistant message
        message_id: MessageId,
    },
    /// Conversation cleared
    Reset,
}

type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Ordered subscriber list
#[derive(Default)]
pub(crate) struct EventBus {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl EventBus {
    pub(crate) fn subscribe(self: &Arc<Self>, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if !self.closed.load(Ordering::Acquire) {
            self.listeners.lock().push((id, listener));
        }
        Subscription {
            id,
            bus: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Deliver to every listener in subscription order
    pub(crate) fn emit(&self, event: &SessionEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            listener(event);
        }
    }

    pub(crate) fn emit_all(&self, events: Vec<SessionEvent>) {
        for event in &events {
            self.emit(event);
        }
    }

    /// Drop every listener and refuse new ones
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.listeners.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// Handle returned by `subscribe`
///
/// Dropping it keeps the listener registered; call
/// [`dispose`](Self::dispose) to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<EventBus>,
}

impl Subscription {
    /// Remove the listener. Returns false if it was already gone.
    pub fn dispose(self) -> bool {
        self.bus.upgrade().is_some_and(|bus| bus.unsubscribe(self.id))
    }

    /// Whether the listener is still registered
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.bus.upgrade().is_some_and(|bus| {
            bus.listeners.lock().iter().any(|(id, _)| *id == self.id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_bus() -> (Arc<EventBus>, Arc<Mutex<Vec<String>>>) {
        (Arc::new(EventBus::default()), Arc::new(Mutex::new(Vec::new())))
    }

    #[test]
    fn test_emit_in_subscription_order() {
        let (bus, seen) = counting_bus();
        for name in ["first", "second"] {
            let seen = seen.clone();
            bus.subscribe(Arc::new(move |_: &SessionEvent| seen.lock().push(name.to_string())));
        }
        bus.emit(&SessionEvent::Reset);
        assert_eq!(*seen.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_dispose_removes_listener() {
        let (bus, seen) = counting_bus();
        let sub = {
            let seen = seen.clone();
            bus.subscribe(Arc::new(move |_: &SessionEvent| seen.lock().push("x".into())))
        };
        assert!(sub.is_active());
        assert!(sub.dispose());
        bus.emit(&SessionEvent::Stopped);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_closed_bus_is_silent() {
        let (bus, seen) = counting_bus();
        {
            let seen = seen.clone();
            bus.subscribe(Arc::new(move |_: &SessionEvent| seen.lock().push("x".into())));
        }
        bus.close();
        bus.emit(&SessionEvent::Reset);
        {
            let seen = seen.clone();
            bus.subscribe(Arc::new(move |_: &SessionEvent| seen.lock().push("y".into())));
        }
        bus.emit(&SessionEvent::Reset);

        assert!(seen.lock().is_empty());
        assert_eq!(bus.len(), 0);
    }

    #[test]
    fn test_listener_may_unsubscribe_during_emit() {
        let bus = Arc::new(EventBus::default());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let sub = {
            let slot = slot.clone();
            bus.subscribe(Arc::new(move |_: &SessionEvent| {
                if let Some(sub) = slot.lock().take() {
                    sub.dispose();
                }
            }))
        };
        *slot.lock() = Some(sub);

        bus.emit(&SessionEvent::Reset);
        assert_eq!(bus.len(), 0);
    }
}

//! Conversation Persistence Boundary
//!
//! The session loads and saves whole message lists through
//! [`ConversationStore`]; storage itself lives outside this crate.
//! [`MemoryStore`] is the in-process implementation used by tests and
//! short-lived tools.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::messages::Message;

/// Load/save of a conversation's messages
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Load the stored conversation (empty if none)
    async fn load(&self) -> anyhow::Result<Vec<Message>>;

    /// Replace the stored conversation
    async fn save(&self, messages: &[Message]) -> anyhow::Result<()>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: RwLock<Vec<Message>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-filled with `messages`
    #[must_use]
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: RwLock::new(messages),
        }
    }

    /// Copy of what is stored
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.read().clone()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn load(&self) -> anyhow::Result<Vec<Message>> {
        Ok(self.snapshot())
    }

    async fn save(&self, messages: &[Message]) -> anyhow::Result<()> {
        *self.messages.write() = messages.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.load().await.unwrap().is_empty());

        store
            .save(&[Message::user("hi"), Message::assistant("hello")])
            .await
            .unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].content, "hello");
    }

    #[test]
    fn test_prefilled_store_loads_without_runtime_setup() {
        let store = MemoryStore::with_messages(vec![Message::system("be brief")]);
        let loaded = tokio_test::block_on(store.load()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(store.snapshot(), loaded);
    }
}

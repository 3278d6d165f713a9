use dashmap::DashMap;

use fm_harness::provider::Message;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Short-term memory: ordered per-conversation turn history.
///
/// The production implementation lives outside this core; the run loop only
/// needs append-and-replay semantics.
#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
    async fn history(&self, conversation_id: &str) -> Result<Vec<Message>>;

    async fn append(&self, conversation_id: &str, message: Message) -> Result<()>;
}

/// A long-term memory entry scored by semantic relevance to the query.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub content: String,
    pub score: f32,
}

/// Long-term memory: top-K semantic recall. Implemented by an external
/// vector store; absent in minimal deployments.
#[async_trait::async_trait]
pub trait MemoryRecall: Send + Sync {
    async fn recall(&self, query: &str, k: usize) -> Result<Vec<ScoredMemory>>;
}

// ---------------------------------------------------------------------------
// InMemoryConversationStore
// ---------------------------------------------------------------------------

/// Process-local conversation store for tests and single-process setups.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: DashMap<String, Vec<Message>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self, conversation_id: &str) -> usize {
        self.conversations
            .get(conversation_id)
            .map(|msgs| msgs.len())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn history(&self, conversation_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .conversations
            .get(conversation_id)
            .map(|msgs| msgs.clone())
            .unwrap_or_default())
    }

    async fn append(&self, conversation_id: &str, message: Message) -> Result<()> {
        self.conversations
            .entry(conversation_id.to_string())
            .or_default()
            .push(message);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_preserves_append_order() {
        let store = InMemoryConversationStore::new();
        store.append("c1", Message::user("first")).await.unwrap();
        store
            .append("c1", Message::assistant("second"))
            .await
            .unwrap();
        store.append("c2", Message::user("other")).await.unwrap();

        let history = store.history("c1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "first");
        assert_eq!(history[1].content, "second");
        assert!(store.history("missing").await.unwrap().is_empty());
    }
}

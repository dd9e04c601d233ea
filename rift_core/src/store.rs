//! Pluggable publish/subscribe store.
//!
//! Cross-process broadcast is optional: a single process is fully correct
//! without any store. When one is configured, the server subscribes to a
//! dispatch subject and forwards each message to the session named by its
//! id, so a peer process can write into sessions it does not own.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;

/// A message routed through the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The session id this message is addressed to.
    pub id: String,
    /// The raw payload to write into that session.
    pub data: Bytes,
}

/// A store failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store is no longer accepting messages.
    #[error("pub/sub store closed")]
    Closed,
}

/// An external publish/subscribe store.
#[async_trait]
pub trait PubSub: Send + Sync + 'static {
    /// Publish a message under `subject`.
    async fn publish(&self, subject: &str, msg: Message) -> Result<(), StoreError>;

    /// Subscribe to `subject`; messages arrive on the returned channel.
    async fn subscribe(&self, subject: &str) -> Result<async_channel::Receiver<Message>, StoreError>;
}

/// An in-process store, useful for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryPubSub {
    topics: DashMap<String, Vec<async_channel::Sender<Message>>>,
}

impl MemoryPubSub {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, subject: &str, msg: Message) -> Result<(), StoreError> {
        if let Some(mut subscribers) = self.topics.get_mut(subject) {
            subscribers.retain(|tx| tx.try_send(msg.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
    ) -> Result<async_channel::Receiver<Message>, StoreError> {
        let (tx, rx) = async_channel::unbounded();
        self.topics.entry(subject.to_string()).or_default().push(tx);
        Ok(rx)
    }
}

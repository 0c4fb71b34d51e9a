//! Queue storage capability.
//!
//! The router hands every queue message to a [`QueueStorage`] before it
//! tries to dispatch it. A message popped for delivery stays "in flight" in
//! the storage until it is acknowledged or handed back with `requeue`.
//!
//! [`MemoryQueueStorage`] is the non-durable default.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::message::Message;

/// Failure reported by a storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Pluggable persistence for queue destinations.
///
/// Implementations must return messages from `pop_next` in the order they
/// were appended, except that a requeued message goes to the front.
#[async_trait]
pub trait QueueStorage: Send + Sync {
    /// Called once before the broker starts accepting connections.
    async fn start(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Called once after the broker stops accepting connections.
    async fn stop(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Append a message at the back of `queue`.
    async fn append(&self, queue: &str, message: Message) -> Result<(), StorageError>;

    /// Return a previously popped message to the front of `queue`.
    async fn requeue(&self, queue: &str, message: Message) -> Result<(), StorageError>;

    /// Remove and return the next pending message of `queue`, marking it in
    /// flight.
    async fn pop_next(&self, queue: &str) -> Result<Option<Message>, StorageError>;

    /// Forget an in-flight message for good.
    async fn acknowledge(&self, queue: &str, message_id: &str) -> Result<(), StorageError>;
}

/// In-memory, non-durable queue storage.
#[derive(Debug, Default)]
pub struct MemoryQueueStorage {
    queues: DashMap<String, VecDeque<Message>>,
    in_flight: DashMap<String, Message>,
}

impl MemoryQueueStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting in `queue`.
    pub fn pending_len(&self, queue: &str) -> usize {
        self.queues.get(queue).map(|q| q.len()).unwrap_or(0)
    }

    /// Number of popped but unacknowledged messages across all queues.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}

#[async_trait]
impl QueueStorage for MemoryQueueStorage {
    async fn append(&self, queue: &str, message: Message) -> Result<(), StorageError> {
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_back(message);
        Ok(())
    }

    async fn requeue(&self, queue: &str, message: Message) -> Result<(), StorageError> {
        self.in_flight.remove(&message.id);
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_front(message);
        Ok(())
    }

    async fn pop_next(&self, queue: &str) -> Result<Option<Message>, StorageError> {
        let next = self.queues.get_mut(queue).and_then(|mut q| q.pop_front());
        if let Some(msg) = &next {
            self.in_flight.insert(msg.id.clone(), msg.clone());
        }
        Ok(next)
    }

    async fn acknowledge(&self, _queue: &str, message_id: &str) -> Result<(), StorageError> {
        self.in_flight.remove(message_id);
        Ok(())
    }
}

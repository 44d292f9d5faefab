//! Durable job queue capability

use crate::error::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

/// Named FIFO queues of JSON payloads
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, queue: &str, payload: serde_json::Value) -> Result<()>;

    /// Oldest payload of `queue`, if any
    async fn dequeue(&self, queue: &str) -> Result<Option<serde_json::Value>>;
}

/// Process-local queue
#[derive(Debug, Default)]
pub struct MemoryTaskQueue {
    queues: Mutex<HashMap<String, VecDeque<serde_json::Value>>>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, queue: &str) -> usize {
        self.queues.lock().await.get(queue).map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, queue: &str, payload: serde_json::Value) -> Result<()> {
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .queues
            .lock()
            .await
            .get_mut(queue)
            .and_then(VecDeque::pop_front))
    }
}

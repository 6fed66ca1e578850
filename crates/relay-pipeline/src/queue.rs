//! Queue seam over the messaging substrate.
//!
//! The pipeline only needs enqueue and dequeue; redelivery and DLQ
//! policy belong to the substrate behind this trait.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::Result;
use crate::message::ReportEvent;

#[async_trait]
pub trait Queue: Send + Sync {
    /// Publish an event. Encoding enforces the message size limit.
    async fn enqueue(&self, event: &ReportEvent) -> Result<()>;

    /// Pop the next event, or `None` when the queue is empty.
    async fn dequeue(&self) -> Result<Option<ReportEvent>>;
}

/// FIFO in-memory queue for tests.
#[derive(Default)]
pub struct MemoryQueue {
    messages: Mutex<VecDeque<String>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, event: &ReportEvent) -> Result<()> {
        // Store the wire form so size limits apply to tests too.
        let body = event.encode()?;
        self.messages.lock().await.push_back(body);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<ReportEvent>> {
        let next = self.messages.lock().await.pop_front();
        next.map(|body| ReportEvent::decode(&body)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn memory_queue_is_fifo() {
        let queue = MemoryQueue::new();
        let first = ReportEvent::Batch {
            receiver: "a".to_string(),
        };
        let second = ReportEvent::Batch {
            receiver: "b".to_string(),
        };
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap(), Some(first));
        assert_eq!(queue.dequeue().await.unwrap(), Some(second));
        assert_eq!(queue.dequeue().await.unwrap(), None);
    }

    #[tokio::test]
    async fn enqueue_applies_the_size_limit() {
        let queue = MemoryQueue::new();
        let event = ReportEvent::Route {
            report_id: Uuid::new_v4(),
            blob_url: "x".repeat(crate::MAX_MESSAGE_BYTES),
            digest: String::new(),
            blob_sub_folder_name: String::new(),
        };
        assert!(queue.enqueue(&event).await.is_err());
        assert!(queue.is_empty().await);
    }
}

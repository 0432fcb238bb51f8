use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::state::{QueueLimits, QueueMetrics, QueueState};
use super::store::QueueStore;
use crate::models::{AgentId, Message, MessageStatus};

/// Volatile queue store. State is lost when the process exits.
pub struct InMemoryQueueStore {
    state: Mutex<QueueState>,
}

impl InMemoryQueueStore {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            state: Mutex::new(QueueState::new(limits)),
        }
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new(QueueLimits::default())
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, message: Message) -> bool {
        self.state.lock().await.enqueue(message, Utc::now())
    }

    async fn dequeue(&self, agent_id: &str) -> Option<Message> {
        self.state.lock().await.dequeue(agent_id, Utc::now())
    }

    async fn next_interrupting(&self, agent_id: &str) -> Option<Message> {
        self.state.lock().await.next_interrupting(agent_id, Utc::now())
    }

    async fn acknowledge(&self, message_id: &str) -> bool {
        self.state.lock().await.acknowledge(message_id, Utc::now())
    }

    async fn mark_failed(&self, message_id: &str, reason: &str) -> bool {
        self.state
            .lock()
            .await
            .mark_failed(message_id, reason, Utc::now())
    }

    async fn release(&self, message_id: &str) -> bool {
        self.state.lock().await.release(message_id)
    }

    async fn get_queue_size(&self) -> usize {
        self.state.lock().await.queue_size()
    }

    async fn get_agent_queue_size(&self, agent_id: &str) -> usize {
        self.state.lock().await.agent_queue_size(agent_id)
    }

    async fn pending_targets(&self) -> Vec<AgentId> {
        self.state.lock().await.pending_targets()
    }

    async fn message_status(&self, message_id: &str) -> Option<MessageStatus> {
        self.state.lock().await.message_status(message_id)
    }

    async fn failure_reason(&self, message_id: &str) -> Option<String> {
        self.state.lock().await.failure_reason(message_id)
    }

    async fn metrics(&self) -> QueueMetrics {
        self.state.lock().await.metrics()
    }

    async fn prune_history(&self, now: DateTime<Utc>) -> usize {
        self.state.lock().await.prune_history(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessagePriority;
    use std::sync::Arc;

    #[tokio::test]
    async fn scenario_single_message_lifecycle() {
        let store = InMemoryQueueStore::default();
        let message = Message::new("A", "B", "ping");
        let id = message.id.clone();

        assert!(store.enqueue(message).await);
        assert_eq!(store.get_queue_size().await, 1);
        assert_eq!(store.get_agent_queue_size("B").await, 1);

        let reserved = store.dequeue("B").await.unwrap();
        assert_eq!(reserved.id, id);
        assert_eq!(store.get_agent_queue_size("B").await, 0);
        assert!(store.acknowledge(&id).await);
        assert_eq!(store.message_status(&id).await, Some(MessageStatus::Delivered));
    }

    #[tokio::test]
    async fn concurrent_dequeues_never_share_a_message() {
        let store = Arc::new(InMemoryQueueStore::default());
        for i in 0..50 {
            let m = Message::new("src", "a", format!("m{i}")).with_priority(MessagePriority::High);
            assert!(store.enqueue(m).await);
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let mut taken = Vec::new();
                    while let Some(m) = store.dequeue("a").await {
                        taken.push(m.id);
                    }
                    taken
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 50);
        assert_eq!(unique.len(), 50);
    }

    #[tokio::test]
    async fn metrics_reflect_lifecycle() {
        let store = InMemoryQueueStore::default();
        let a = Message::new("s", "t", "a");
        let b = Message::new("s", "t", "b");
        store.enqueue(a.clone()).await;
        store.enqueue(b.clone()).await;
        store.dequeue("t").await;

        let metrics = store.metrics().await;
        assert_eq!(metrics.enqueued, 2);
        assert_eq!(metrics.dequeued, 1);
        assert_eq!(metrics.current_size, 1);
        assert_eq!(metrics.in_flight, 1);
    }
}

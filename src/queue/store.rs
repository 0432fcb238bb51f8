use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::state::QueueMetrics;
use crate::models::{AgentId, Message, MessageStatus};

/// Ordered storage of pending messages and their terminal history.
///
/// Every method is a single atomic step under the implementation's lock.
/// Rejections are reported as `false`/`None`; the facade maps them to errors.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Add a message. False when full, already expired, or a known id.
    async fn enqueue(&self, message: Message) -> bool;

    /// Reserve the best pending message addressed to `agent_id` or to the
    /// broadcast marker, skipping the caller's own broadcasts. Expired
    /// candidates are dropped on the way.
    async fn dequeue(&self, agent_id: &str) -> Option<Message>;

    /// Like `dequeue`, restricted to messages allowed to interrupt.
    async fn next_interrupting(&self, agent_id: &str) -> Option<Message>;

    async fn acknowledge(&self, message_id: &str) -> bool;

    async fn mark_failed(&self, message_id: &str, reason: &str) -> bool;

    /// Put an in-flight reservation back into pending at its original position.
    async fn release(&self, message_id: &str) -> bool;

    async fn get_queue_size(&self) -> usize;

    async fn get_agent_queue_size(&self, agent_id: &str) -> usize;

    /// Targets with pending work, best pending score first.
    async fn pending_targets(&self) -> Vec<AgentId>;

    async fn message_status(&self, message_id: &str) -> Option<MessageStatus>;

    async fn failure_reason(&self, message_id: &str) -> Option<String>;

    async fn metrics(&self) -> QueueMetrics;

    /// Drop terminal history older than the retention window.
    async fn prune_history(&self, now: DateTime<Utc>) -> usize;

    /// Start store-owned background work, if any.
    fn spawn_maintenance(self: Arc<Self>, _cancel: CancellationToken) -> Option<JoinHandle<()>> {
        None
    }
}

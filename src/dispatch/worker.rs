use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::inbox::WorkerInbox;
use super::DispatchContext;
use crate::delivery::{DeliveryError, DeliveryRouter};
use crate::models::{AgentId, AgentStatus, Message};

struct WorkerHandle {
    inbox: Arc<WorkerInbox>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// One worker task per registered agent.
pub struct WorkerPool {
    ctx: Arc<DispatchContext>,
    workers: Mutex<HashMap<AgentId, WorkerHandle>>,
    /// Stopped workers still finishing a delivery
    retiring: Mutex<HashMap<AgentId, JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(ctx: Arc<DispatchContext>) -> Self {
        Self {
            ctx,
            workers: Mutex::new(HashMap::new()),
            retiring: Mutex::new(HashMap::new()),
        }
    }

    /// Start a worker for `agent_id` unless one is already running.
    ///
    /// A replacement for a retiring worker waits for it to finish first, so
    /// an agent never sees two deliveries at once.
    pub async fn spawn(&self, agent_id: &str, parent: &CancellationToken) -> bool {
        let mut workers = self.workers.lock().await;
        if workers.contains_key(agent_id) {
            return false;
        }

        let predecessor = self.retiring.lock().await.remove(agent_id);
        let inbox = Arc::new(WorkerInbox::new(self.ctx.settings.inbox_capacity));
        let cancel = parent.child_token();
        let join = tokio::spawn(run_worker(
            agent_id.to_string(),
            Arc::clone(&inbox),
            Arc::clone(&self.ctx),
            cancel.clone(),
            predecessor,
        ));

        workers.insert(
            agent_id.to_string(),
            WorkerHandle {
                inbox,
                cancel,
                join,
            },
        );
        true
    }

    /// Stop the worker for `agent_id`. Its inbox is released back to the store.
    pub async fn stop(&self, agent_id: &str) -> bool {
        let Some(handle) = self.workers.lock().await.remove(agent_id) else {
            return false;
        };
        handle.cancel.cancel();
        self.retiring
            .lock()
            .await
            .insert(agent_id.to_string(), handle.join);
        true
    }

    pub async fn inbox(&self, agent_id: &str) -> Option<Arc<WorkerInbox>> {
        self.workers
            .lock()
            .await
            .get(agent_id)
            .map(|h| Arc::clone(&h.inbox))
    }

    pub async fn inboxes(&self) -> Vec<(AgentId, Arc<WorkerInbox>)> {
        self.workers
            .lock()
            .await
            .iter()
            .map(|(id, h)| (id.clone(), Arc::clone(&h.inbox)))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.lock().await.is_empty()
    }

    /// Cancel every worker and hand back their join handles.
    pub async fn shutdown(&self) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .await
            .drain()
            .map(|(_, h)| {
                h.cancel.cancel();
                h.join
            })
            .collect();
        handles.extend(self.retiring.lock().await.drain().map(|(_, join)| join));
        handles
    }
}

async fn run_worker(
    agent_id: AgentId,
    inbox: Arc<WorkerInbox>,
    ctx: Arc<DispatchContext>,
    cancel: CancellationToken,
    predecessor: Option<JoinHandle<()>>,
) {
    if let Some(previous) = predecessor {
        let _ = previous.await;
    }
    debug!("Worker for {} started", agent_id);

    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = inbox.pop() => message,
        };
        deliver_one(&agent_id, message, &ctx).await;
        ctx.wake.notify_one();
    }

    let leftover = inbox.drain().await;
    for message in &leftover {
        ctx.store.release(&message.id).await;
    }
    if !leftover.is_empty() {
        info!(
            "Worker for {} stopped, released {} queued messages",
            agent_id,
            leftover.len()
        );
    } else {
        debug!("Worker for {} stopped", agent_id);
    }
}

/// One delivery attempt for a reserved message, ending in ack or fail.
async fn deliver_one(agent_id: &str, mut message: Message, ctx: &DispatchContext) {
    let connection = {
        let mut registry = ctx.registry.lock().await;
        match registry.get(agent_id).cloned() {
            Some(connection) if !connection.is_offline() => {
                let _ = registry.set_status(agent_id, AgentStatus::Busy);
                Some(connection)
            }
            _ => None,
        }
    };

    let Some(connection) = connection else {
        let reason = DeliveryError::TargetNotFound(agent_id.to_string());
        warn!("Not delivering {}: {}", message.id, reason);
        ctx.store.mark_failed(&message.id, &reason.to_string()).await;
        return;
    };

    let method = DeliveryRouter::resolve_method(&message, &connection);
    debug!(
        "Delivering {} to {} via {} ({} priority)",
        message.id, agent_id, method, message.priority
    );

    let timeout = ctx.settings.delivery_timeout;
    let outcome = match tokio::time::timeout(
        timeout,
        ctx.router.backend(method).deliver(&mut message, &connection),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(DeliveryError::Timeout(timeout)),
    };

    let delivered = outcome.is_ok();
    match outcome {
        Ok(ack) => {
            ctx.store.acknowledge(&message.id).await;
            info!(
                "Delivered {} to {} via {}: {}",
                message.id, agent_id, ack.method, ack.detail
            );
        }
        Err(e) => {
            warn!(
                "Delivery of {} to {} failed after {} attempts: {}",
                message.id, agent_id, message.attempt_count, e
            );
            ctx.store.mark_failed(&message.id, &e.to_string()).await;
        }
    }

    let mut registry = ctx.registry.lock().await;
    if registry
        .get(agent_id)
        .is_some_and(|c| c.status == AgentStatus::Busy)
    {
        let _ = registry.set_status(agent_id, AgentStatus::Online);
    }
    if delivered {
        registry.touch(agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::mock_backend::MockBackend;
    use crate::delivery::DeliveryRouter;
    use crate::dispatch::{DispatchSettings, UrgentInterruptDetector};
    use crate::models::{AgentConnection, DeliveryMethod, MessageStatus};
    use crate::queue::{InMemoryQueueStore, QueueStore};
    use std::time::Duration;

    fn context(backend: Arc<MockBackend>, delivery_timeout: Duration) -> Arc<DispatchContext> {
        let router = DeliveryRouter::new(backend.clone(), backend);
        Arc::new(DispatchContext::new(
            Arc::new(InMemoryQueueStore::default()),
            router,
            UrgentInterruptDetector::new(2, Duration::from_millis(1500), Duration::from_secs(30)),
            DispatchSettings {
                delivery_timeout,
                ..DispatchSettings::default()
            },
        ))
    }

    async fn reserve(ctx: &DispatchContext, target: &str) -> Message {
        let message = Message::new("src", target, "hello")
            .with_delivery_method(DeliveryMethod::DirectInjection);
        assert!(ctx.store.enqueue(message).await);
        ctx.store.dequeue(target).await.unwrap()
    }

    #[tokio::test]
    async fn deliver_one_acknowledges_and_restores_online() {
        let backend = Arc::new(MockBackend::new(DeliveryMethod::DirectInjection));
        let ctx = context(backend.clone(), Duration::from_secs(5));
        ctx.registry
            .lock()
            .await
            .register(AgentConnection::new("b", "B", "t"));

        let message = reserve(&ctx, "b").await;
        let id = message.id.clone();
        deliver_one("b", message, &ctx).await;

        assert_eq!(ctx.store.message_status(&id).await, Some(MessageStatus::Delivered));
        assert_eq!(backend.call_count(), 1);
        assert_eq!(
            ctx.registry.lock().await.get("b").unwrap().status,
            AgentStatus::Online
        );
    }

    #[tokio::test]
    async fn offline_agent_fails_without_touching_backend() {
        let backend = Arc::new(MockBackend::new(DeliveryMethod::DirectInjection));
        let ctx = context(backend.clone(), Duration::from_secs(5));
        {
            let mut registry = ctx.registry.lock().await;
            registry.register(AgentConnection::new("b", "B", "t"));
            registry.mark_offline("b").unwrap();
        }

        let message = reserve(&ctx, "b").await;
        let id = message.id.clone();
        deliver_one("b", message, &ctx).await;

        assert_eq!(ctx.store.message_status(&id).await, Some(MessageStatus::Failed));
        assert!(ctx
            .store
            .failure_reason(&id)
            .await
            .unwrap()
            .contains("Target not found"));
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn slow_delivery_times_out_as_failure() {
        let backend = Arc::new(
            MockBackend::new(DeliveryMethod::DirectInjection).with_delay(Duration::from_secs(5)),
        );
        let ctx = context(backend, Duration::from_millis(50));
        ctx.registry
            .lock()
            .await
            .register(AgentConnection::new("b", "B", "t"));

        let message = reserve(&ctx, "b").await;
        let id = message.id.clone();
        deliver_one("b", message, &ctx).await;

        assert_eq!(ctx.store.message_status(&id).await, Some(MessageStatus::Failed));
        assert!(ctx.store.failure_reason(&id).await.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn cancelled_worker_releases_its_inbox() {
        let backend = Arc::new(MockBackend::new(DeliveryMethod::DirectInjection));
        let ctx = context(backend.clone(), Duration::from_secs(5));
        let message = reserve(&ctx, "b").await;
        let id = message.id.clone();

        let inbox = Arc::new(WorkerInbox::new(4));
        inbox.push(message).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        run_worker("b".to_string(), inbox, Arc::clone(&ctx), cancel, None).await;

        assert_eq!(ctx.store.message_status(&id).await, Some(MessageStatus::Queued));
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn pool_spawns_one_worker_per_agent() {
        let backend = Arc::new(MockBackend::new(DeliveryMethod::DirectInjection));
        let ctx = context(backend, Duration::from_secs(5));
        let pool = WorkerPool::new(Arc::clone(&ctx));
        let root = CancellationToken::new();

        assert!(pool.spawn("a", &root).await);
        assert!(!pool.spawn("a", &root).await);
        assert!(pool.spawn("b", &root).await);
        assert_eq!(pool.len().await, 2);

        assert!(pool.stop("a").await);
        assert!(!pool.stop("a").await);
        assert!(pool.inbox("a").await.is_none());
        assert!(pool.spawn("a", &root).await);

        let handles = pool.shutdown().await;
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
        assert!(pool.is_empty().await);
    }
}

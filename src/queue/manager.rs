use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::QueueMetrics;
use super::store::QueueStore;
use crate::delivery::DeliveryRouter;
use crate::dispatch::{
    run_dispatcher, DispatchContext, DispatchSettings, UrgentInterruptDetector, WorkerPool,
};
use crate::models::{
    AgentConnection, AgentId, DeliveryMethod, Message, MessageId, MessagePriority, MessageStatus,
    BROADCAST_TARGET,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue is full")]
    QueueFull,

    #[error("Message expired before it was queued")]
    MessageExpired,

    #[error("Target agent not found: {0}")]
    TargetNotFound(AgentId),

    #[error("Invalid agent: {0}")]
    InvalidAgent(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Per-send knobs for `QueueManager::send_message`
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub priority: MessagePriority,
    pub urgent: bool,
    pub delivery_method: DeliveryMethod,
    /// Overrides the configured default TTL
    pub ttl: Option<Duration>,
    pub metadata: HashMap<String, String>,
}

impl SendOptions {
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    pub fn with_delivery_method(mut self, method: DeliveryMethod) -> Self {
        self.delivery_method = method;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue_size: usize,
    pub in_flight: usize,
    pub is_running: bool,
    pub agent_connections: usize,
    pub delivery_workers: usize,
    pub urgent_mode_active: bool,
    pub metrics: QueueMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub queue_system: QueueStatus,
    pub registered_agents: usize,
    pub agent_details: Vec<AgentConnection>,
}

#[derive(Default)]
struct Lifecycle {
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

/// Entry point for producers and operators
///
/// The QueueManager owns the store, the agent registry, the worker pool and
/// the dispatcher. Producers call `send_message`/`broadcast_message`;
/// delivery happens in the background between `start` and `shutdown`.
pub struct QueueManager {
    ctx: Arc<DispatchContext>,
    pool: Arc<WorkerPool>,
    lifecycle: Mutex<Lifecycle>,
    default_ttl: Option<Duration>,
}

impl QueueManager {
    pub fn new(
        store: Arc<dyn QueueStore>,
        router: DeliveryRouter,
        urgent: UrgentInterruptDetector,
        settings: DispatchSettings,
    ) -> Self {
        let ctx = Arc::new(DispatchContext::new(store, router, urgent, settings));
        Self {
            pool: Arc::new(WorkerPool::new(Arc::clone(&ctx))),
            ctx,
            lifecycle: Mutex::new(Lifecycle::default()),
            default_ttl: None,
        }
    }

    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.ctx.store
    }

    async fn running_token(&self) -> Option<CancellationToken> {
        self.lifecycle.lock().await.cancel.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.running_token().await.is_some()
    }

    /// Register or update an agent. Spawns its worker when running.
    pub async fn register_agent(
        &self,
        agent_id: &str,
        name: &str,
        capabilities: Vec<String>,
        delivery_methods: Vec<DeliveryMethod>,
        target_ref: &str,
    ) -> bool {
        let connection = AgentConnection::new(agent_id, name, target_ref)
            .with_capabilities(capabilities)
            .with_delivery_methods(delivery_methods);

        if !self.ctx.registry.lock().await.register(connection) {
            warn!("Rejected agent registration with empty id");
            return false;
        }
        info!("Registered agent {} ({}) at {}", agent_id, name, target_ref);

        if let Some(cancel) = self.running_token().await {
            self.pool.spawn(agent_id, &cancel).await;
            self.ctx.wake.notify_one();
        }
        true
    }

    /// Remove an agent and stop its worker. Its queued messages fail at dispatch.
    pub async fn deregister_agent(&self, agent_id: &str) -> bool {
        if self.ctx.registry.lock().await.deregister(agent_id).is_none() {
            return false;
        }
        self.pool.stop(agent_id).await;
        self.ctx.wake.notify_one();
        info!("Deregistered agent {}", agent_id);
        true
    }

    pub async fn heartbeat(&self, agent_id: &str) -> bool {
        self.ctx.registry.lock().await.touch(agent_id)
    }

    /// Queue one message. A target of `*` fans out like `broadcast_message`
    /// and returns the first fan-out id.
    pub async fn send_message(
        &self,
        source: &str,
        target: &str,
        content: &str,
        options: SendOptions,
    ) -> QueueResult<MessageId> {
        if source.trim().is_empty() {
            return Err(QueueError::InvalidAgent(source.to_string()));
        }
        if target == BROADCAST_TARGET {
            return self
                .fan_out(source, content, &options)
                .await
                .into_iter()
                .next()
                .ok_or_else(|| QueueError::TargetNotFound(BROADCAST_TARGET.to_string()));
        }
        let id = self.enqueue_one(source, target, content, &options).await?;
        self.ctx.wake.notify_one();
        Ok(id)
    }

    async fn enqueue_one(
        &self,
        source: &str,
        target: &str,
        content: &str,
        options: &SendOptions,
    ) -> QueueResult<MessageId> {
        if !self.ctx.registry.lock().await.contains(target) {
            return Err(QueueError::TargetNotFound(target.to_string()));
        }

        let mut message = Message::new(source, target, content)
            .with_priority(options.priority)
            .with_urgent(options.urgent)
            .with_delivery_method(options.delivery_method);
        if let Some(ttl) = options.ttl.or(self.default_ttl) {
            message = message.with_ttl(ttl);
        }
        message.metadata = options.metadata.clone();

        if message.is_expired() {
            return Err(QueueError::MessageExpired);
        }

        let id = message.id.clone();
        if !self.ctx.store.enqueue(message).await {
            return Err(QueueError::QueueFull);
        }
        debug!(
            "Queued {} from {} to {} ({} priority{})",
            id,
            source,
            target,
            options.priority,
            if options.urgent { ", urgent" } else { "" }
        );

        if options.urgent {
            self.record_urgent_trigger().await;
        }
        Ok(id)
    }

    /// One independent message per registered agent except the sender.
    pub async fn broadcast_message(
        &self,
        source: &str,
        content: &str,
        priority: MessagePriority,
    ) -> Vec<MessageId> {
        if source.trim().is_empty() {
            return Vec::new();
        }
        self.fan_out(source, content, &SendOptions::default().with_priority(priority))
            .await
    }

    async fn fan_out(&self, source: &str, content: &str, options: &SendOptions) -> Vec<MessageId> {
        let recipients: Vec<AgentId> = self
            .ctx
            .registry
            .lock()
            .await
            .ids()
            .into_iter()
            .filter(|id| id != source)
            .collect();

        let mut ids = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            match self.enqueue_one(source, &recipient, content, options).await {
                Ok(id) => ids.push(id),
                Err(e) => warn!("Broadcast from {} to {} not queued: {}", source, recipient, e),
            }
        }
        info!("Broadcast from {} queued for {} agents", source, ids.len());
        self.ctx.wake.notify_one();
        ids
    }

    /// Count one urgent trigger occurrence.
    pub async fn signal_urgent(&self) {
        self.record_urgent_trigger().await;
        self.ctx.wake.notify_one();
    }

    async fn record_urgent_trigger(&self) {
        if self.ctx.urgent.lock().await.record_trigger(Instant::now()) {
            info!("Urgent mode activated");
        }
    }

    pub async fn message_status(&self, message_id: &str) -> Option<MessageStatus> {
        self.ctx.store.message_status(message_id).await
    }

    pub async fn failure_reason(&self, message_id: &str) -> Option<String> {
        self.ctx.store.failure_reason(message_id).await
    }

    pub async fn get_queue_status(&self) -> QueueStatus {
        let metrics = self.ctx.store.metrics().await;
        QueueStatus {
            queue_size: metrics.current_size,
            in_flight: metrics.in_flight,
            is_running: self.is_running().await,
            agent_connections: self.ctx.registry.lock().await.len(),
            delivery_workers: self.pool.len().await,
            urgent_mode_active: self.ctx.urgent.lock().await.is_active(Instant::now()),
            metrics,
        }
    }

    pub async fn get_system_status(&self) -> SystemStatus {
        let queue_system = self.get_queue_status().await;
        let agent_details = self.ctx.registry.lock().await.all();
        SystemStatus {
            queue_system,
            registered_agents: agent_details.len(),
            agent_details,
        }
    }

    /// Spawn workers, the dispatcher and maintenance. No-op when running.
    pub async fn start(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.cancel.is_some() {
            return false;
        }
        let cancel = CancellationToken::new();

        let agents = self.ctx.registry.lock().await.ids();
        for agent_id in &agents {
            self.pool.spawn(agent_id, &cancel).await;
        }

        lifecycle.tasks.push(tokio::spawn(run_dispatcher(
            Arc::clone(&self.ctx),
            Arc::clone(&self.pool),
            cancel.clone(),
        )));

        let store_maintenance = Arc::clone(&self.ctx.store).spawn_maintenance(cancel.clone());
        let prune_inline = store_maintenance.is_none();
        lifecycle.tasks.extend(store_maintenance);
        lifecycle.tasks.push(tokio::spawn(run_maintenance(
            Arc::clone(&self.ctx),
            cancel.clone(),
            prune_inline,
        )));

        lifecycle.cancel = Some(cancel);
        info!("Queue manager started with {} agents", agents.len());
        true
    }

    /// Stop dispatching, let in-progress deliveries finish, and join all
    /// tasks under the shutdown timeout.
    pub async fn shutdown(&self) {
        let (cancel, mut tasks) = {
            let mut lifecycle = self.lifecycle.lock().await;
            let Some(cancel) = lifecycle.cancel.take() else {
                return;
            };
            (cancel, std::mem::take(&mut lifecycle.tasks))
        };

        cancel.cancel();
        tasks.extend(self.pool.shutdown().await);

        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let timeout = self.ctx.settings.shutdown_timeout;
        if tokio::time::timeout(timeout, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("Shutdown timed out after {:?}; aborting remaining tasks", timeout);
            for handle in aborts {
                handle.abort();
            }
        }
        info!("Queue manager stopped");
    }
}

/// Health sweep, urgent-mode expiry and (for stores without their own
/// maintenance) history pruning.
async fn run_maintenance(ctx: Arc<DispatchContext>, cancel: CancellationToken, prune_history: bool) {
    let mut health = tokio::time::interval(ctx.settings.health_interval);
    let mut cleanup = tokio::time::interval(ctx.settings.cleanup_interval);
    health.tick().await;
    cleanup.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = health.tick() => {
                if let Some(agent_timeout) = ctx.settings.agent_timeout {
                    let stale = ctx
                        .registry
                        .lock()
                        .await
                        .sweep_stale(agent_timeout, chrono::Utc::now());
                    for agent_id in stale {
                        warn!("Agent {} missed its heartbeat, marking offline", agent_id);
                    }
                }
                if ctx.urgent.lock().await.expire(Instant::now()) {
                    info!("Urgent mode ended");
                }
            }
            _ = cleanup.tick(), if prune_history => {
                let removed = ctx.store.prune_history(chrono::Utc::now()).await;
                if removed > 0 {
                    debug!("Pruned {} history entries", removed);
                }
            }
        }
    }
}

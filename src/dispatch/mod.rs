//! Moving messages from the shared store to per-agent workers.
//!
//! One dispatcher task pops the store in score order and fills each agent's
//! bounded inbox. One worker task per agent drains its inbox and makes at
//! most one delivery attempt at a time.

mod dispatcher;
mod inbox;
mod urgent;
mod worker;

pub use dispatcher::{dispatch_cycle, run_dispatcher};
pub use inbox::WorkerInbox;
pub use urgent::UrgentInterruptDetector;
pub use worker::WorkerPool;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use crate::agents::AgentRegistry;
use crate::config::Config;
use crate::delivery::DeliveryRouter;
use crate::queue::QueueStore;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub poll_interval: Duration,
    pub inbox_capacity: usize,
    pub delivery_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub health_interval: Duration,
    /// `None` disables the stale-agent sweep
    pub agent_timeout: Option<Duration>,
    pub cleanup_interval: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.dispatch.poll_interval(),
            inbox_capacity: config.dispatch.inbox_capacity,
            delivery_timeout: config.dispatch.delivery_timeout(),
            shutdown_timeout: config.dispatch.shutdown_timeout(),
            health_interval: config.dispatch.health_interval(),
            agent_timeout: config.dispatch.agent_timeout(),
            cleanup_interval: config.queue.cleanup_interval(),
        }
    }
}

/// Services shared by the dispatcher, the workers and the facade.
pub struct DispatchContext {
    pub store: Arc<dyn QueueStore>,
    pub registry: Mutex<AgentRegistry>,
    pub router: DeliveryRouter,
    pub urgent: Mutex<UrgentInterruptDetector>,
    /// Wakes the dispatcher on enqueue and on worker completion
    pub wake: Notify,
    pub settings: DispatchSettings,
}

impl DispatchContext {
    pub fn new(
        store: Arc<dyn QueueStore>,
        router: DeliveryRouter,
        urgent: UrgentInterruptDetector,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            registry: Mutex::new(AgentRegistry::new()),
            router,
            urgent: Mutex::new(urgent),
            wake: Notify::new(),
            settings,
        }
    }
}

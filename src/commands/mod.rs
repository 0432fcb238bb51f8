pub mod send;
pub mod serve;
pub mod status;

use anyhow::{Context, Result};
use std::sync::Arc;

use missive::config::{Config, StorageKind};
use missive::delivery::DeliveryRouter;
use missive::dispatch::{DispatchSettings, UrgentInterruptDetector};
use missive::queue::{FileQueueStore, InMemoryQueueStore, QueueManager, QueueStore};

pub async fn open_store(config: &Config) -> Result<Arc<dyn QueueStore>> {
    let store: Arc<dyn QueueStore> = match config.queue.storage {
        StorageKind::Memory => Arc::new(InMemoryQueueStore::new(config.queue.limits())),
        StorageKind::File => {
            let data_dir = config.queue.data_dir();
            let store = FileQueueStore::open(
                &data_dir,
                &config.queue.name,
                config.queue.limits(),
                config.queue.cleanup_interval(),
            )
            .await
            .with_context(|| format!("Failed to open queue store in {:?}", data_dir))?;
            Arc::new(store)
        }
    };
    Ok(store)
}

pub async fn build_manager(config: &Config) -> Result<QueueManager> {
    let store = open_store(config).await?;
    let router = DeliveryRouter::from_config(config).context("Invalid injection heuristics")?;
    Ok(QueueManager::new(
        store,
        router,
        UrgentInterruptDetector::from_config(&config.urgent),
        DispatchSettings::from_config(config),
    )
    .with_default_ttl(config.queue.default_ttl()))
}

/// Register every agent listed in the config. Returns how many were accepted.
pub async fn register_configured_agents(manager: &QueueManager, config: &Config) -> usize {
    let mut registered = 0;
    for agent in &config.agents {
        if manager
            .register_agent(
                &agent.id,
                agent.display_name(),
                agent.capabilities.clone(),
                agent.delivery_methods.clone(),
                &agent.target,
            )
            .await
        {
            registered += 1;
        }
    }
    registered
}

use anyhow::Result;
use clap::Args as ClapArgs;
use serde_json::json;
use std::path::PathBuf;

use missive::config::{Config, StorageKind};

#[derive(ClapArgs)]
pub struct Args {
    /// Custom config file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

pub async fn execute(_args: Args, config: Config) -> Result<()> {
    let config = config.with_storage(StorageKind::File);
    let store = super::open_store(&config).await?;
    let metrics = store.metrics().await;

    let mut agents = Vec::with_capacity(config.agents.len());
    for agent in &config.agents {
        agents.push(json!({
            "id": agent.id,
            "name": agent.display_name(),
            "target": agent.target,
            "queued": store.get_agent_queue_size(&agent.id).await,
        }));
    }

    let report = json!({
        "queue": config.queue.name,
        "data_dir": config.queue.data_dir(),
        "metrics": metrics,
        "agents": agents,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

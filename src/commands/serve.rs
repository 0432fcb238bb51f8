use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use std::path::PathBuf;

use super::{build_manager, register_configured_agents};
use missive::config::Config;

#[derive(ClapArgs)]
pub struct Args {
    /// Custom config file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

pub async fn execute(_args: Args, config: Config) -> Result<()> {
    let manager = build_manager(&config).await?;
    let registered = register_configured_agents(&manager, &config).await;
    if registered == 0 {
        tracing::warn!("No agents configured; messages will be rejected until one registers");
    }

    manager.start().await;
    println!(
        "missive serving {} agents from queue '{}' (Ctrl-C to stop)",
        registered, config.queue.name
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    println!("Shutting down...");
    manager.shutdown().await;

    let status = manager.get_queue_status().await;
    println!(
        "Stopped with {} queued, {} delivered, {} failed",
        status.queue_size, status.metrics.acknowledged, status.metrics.failed
    );
    Ok(())
}

use anyhow::{bail, Result};
use clap::Args as ClapArgs;
use std::path::PathBuf;
use std::time::Duration;

use super::{build_manager, register_configured_agents};
use missive::config::Config;
use missive::models::{DeliveryMethod, MessagePriority, MessageStatus};
use missive::queue::SendOptions;

#[derive(ClapArgs)]
pub struct Args {
    /// Message content
    pub content: String,

    /// Target agent id
    #[arg(long)]
    pub to: String,

    /// Source agent id
    #[arg(long, default_value = "cli")]
    pub from: String,

    /// Window or pane reference for a target not listed in the config
    #[arg(long)]
    pub target: Option<String>,

    /// low, normal, high, urgent or critical
    #[arg(short, long, default_value = "normal")]
    pub priority: MessagePriority,

    /// Mark the message urgent
    #[arg(short, long)]
    pub urgent: bool,

    /// direct, remote or hybrid
    #[arg(short, long, default_value = "hybrid")]
    pub method: DeliveryMethod,

    /// Seconds to wait for a terminal status
    #[arg(short, long, default_value_t = 30)]
    pub wait: u64,

    /// Custom config file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

pub async fn execute(args: Args, config: Config) -> Result<()> {
    let manager = build_manager(&config).await?;
    register_configured_agents(&manager, &config).await;

    if config.get_agent(&args.to).is_none() {
        let target = args.target.clone().unwrap_or_else(|| args.to.clone());
        manager
            .register_agent(&args.to, &args.to, Vec::new(), Vec::new(), &target)
            .await;
    }

    let mut options = SendOptions::default()
        .with_priority(args.priority)
        .with_delivery_method(args.method);
    if args.urgent {
        options = options.urgent();
    }

    let id = manager
        .send_message(&args.from, &args.to, &args.content, options)
        .await?;
    println!("Queued {} for {}", id, args.to);

    manager.start().await;
    let status = wait_for_terminal(&manager, &id, Duration::from_secs(args.wait)).await;
    let reason = manager.failure_reason(&id).await;
    manager.shutdown().await;

    match status {
        Some(MessageStatus::Delivered) => {
            println!("{}: delivered", id);
            Ok(())
        }
        Some(MessageStatus::Failed) => bail!(
            "{}: failed ({})",
            id,
            reason.unwrap_or_else(|| "no reason recorded".to_string())
        ),
        Some(MessageStatus::Expired) => bail!("{}: expired before delivery", id),
        _ => bail!("{}: no terminal status after {}s", id, args.wait),
    }
}

async fn wait_for_terminal(
    manager: &missive::queue::QueueManager,
    id: &str,
    wait: Duration,
) -> Option<MessageStatus> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let status = manager.message_status(id).await;
        if status.is_some_and(MessageStatus::is_terminal) || tokio::time::Instant::now() >= deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

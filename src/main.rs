use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::{Cli, Commands};
use missive::config::Config;

fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.as_str()));

    match &config.log.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "missive.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

fn config_arg(command: &Commands) -> Option<PathBuf> {
    match command {
        Commands::Serve(args) => args.config.clone(),
        Commands::Send(args) => args.config.clone(),
        Commands::Status(args) => args.config.clone(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(config_arg(&cli.command))?;
    let _guard = init_tracing(&config);

    match cli.command {
        Commands::Serve(args) => commands::serve::execute(args, config).await,
        Commands::Send(args) => commands::send::execute(args, config).await,
        Commands::Status(args) => commands::status::execute(args, config).await,
    }
}

use clap::{Parser, Subcommand};

use crate::commands::{send, serve, status};

#[derive(Parser)]
#[command(name = "missive")]
#[command(about = "Priority message queue and delivery for externally controlled agents")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the queue and deliver to the configured agents until Ctrl-C
    Serve(serve::Args),

    /// Deliver one message through a short-lived queue
    Send(send::Args),

    /// Print the persisted queue status as JSON
    Status(status::Args),
}

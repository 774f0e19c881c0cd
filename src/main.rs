//! chat-sync - live-sync chat client
//!
//! Keeps a conversation's messages in one ordered list while the store
//! pushes changes, and sends text and images into it.

mod backend;
mod commands;
mod config;
mod models;
mod session;
mod sync;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chat-sync")]
#[command(about = "Live-sync chat client with ordered message reconciliation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a conversation and chat interactively
    Chat {
        /// Conversation ID
        conversation: String,
    },

    /// Send a text message
    Send {
        /// Conversation ID
        #[arg(short, long)]
        to: String,

        /// Message content
        message: String,
    },

    /// Upload and send an image
    SendImage {
        /// Conversation ID
        #[arg(short, long)]
        to: String,

        /// Image file to send
        path: PathBuf,
    },

    /// Replay a JSON-lines file of change events offline
    Replay {
        /// File with one change event per line
        file: PathBuf,

        /// Pretend the viewer is scrolled away from the bottom
        #[arg(long)]
        detached: bool,
    },

    /// Show or update configuration
    Config {
        /// Stable sender ID
        #[arg(long)]
        sender_id: Option<String>,

        /// Name shown next to your messages
        #[arg(long)]
        display_name: Option<String>,

        /// Base URL of the message store
        #[arg(long)]
        store_url: Option<String>,

        /// Base URL of the change feed (defaults to the store URL)
        #[arg(long)]
        feed_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Chat { conversation } => {
            commands::chat(&conversation).await?;
        }
        Commands::Send { to, message } => {
            tracing::info!("Sending message...");
            commands::send_message(&to, &message).await?;
        }
        Commands::SendImage { to, path } => {
            commands::send_image(&to, &path).await?;
        }
        Commands::Replay { file, detached } => {
            commands::replay(&file, detached).await?;
        }
        Commands::Config {
            sender_id,
            display_name,
            store_url,
            feed_url,
        } => {
            commands::configure(sender_id, display_name, store_url, feed_url)?;
        }
    }

    Ok(())
}

//! Orderflow CLI - Database migrations and stream tools.
//!
//! # Usage
//!
//! ```bash
//! # Run database migrations
//! of-cli migrate
//!
//! # Publish order JSON files to the ingestion stream
//! of-cli publish orders/model.json orders/second.json
//!
//! # Publish to a different topic, skipping validation
//! of-cli publish --topic orders-replay --raw broken.json
//! ```
//!
//! # Commands
//!
//! - `migrate` - Run database migrations
//! - `publish` - Append order messages to the stream

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "of-cli")]
#[command(author, version, about = "Orderflow CLI tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Publish order JSON files to the ingestion stream
    Publish {
        /// Files containing one order JSON document each
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Topic to publish to (defaults to `ORDERFLOW_STREAM_TOPIC`)
        #[arg(short, long)]
        topic: Option<String>,

        /// Publish payloads as-is without decoding them first
        #[arg(long)]
        raw: bool,
    },
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let result: Result<(), Box<dyn std::error::Error>> = run(cli).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Migrate => commands::migrate::run().await?,
        Commands::Publish { files, topic, raw } => {
            let published = commands::publish::files(&files, topic, raw).await?;
            tracing::info!("Published {published} message(s)");
        }
    }
    Ok(())
}

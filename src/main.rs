mod cli;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tether::app::App;
use tether::config::TetherConfig;
use tether::context::NoEntries;
use tether::memory::MemoryType;

#[derive(Parser)]
#[command(name = "tether", version, about = "Local AI runtime with supervised inference and long-term memory")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the inference server and model status
    Status,
    /// Launch the inference server and keep it running until Ctrl-C
    Serve,
    /// Download a model (defaults to the configured chat model)
    Pull { model: Option<String> },
    /// Send one message and stream the reply
    Chat {
        message: String,
        /// Journal entry the message is about
        #[arg(long)]
        entry: Option<String>,
        /// Do not extract a memory from this exchange
        #[arg(long)]
        no_remember: bool,
    },
    /// Store a memory directly
    Remember {
        text: String,
        #[arg(long, default_value_t = 0.5)]
        importance: f64,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Search memories by meaning
    Recall {
        query: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Inspect and manage stored memories
    Memories {
        #[command(subcommand)]
        action: MemoriesAction,
    },
}

#[derive(Subcommand)]
enum MemoriesAction {
    /// Counts by type, pin state and archive files
    Stats,
    /// Archive memories over the capacity limit now
    Prune,
    /// Toggle a memory's pin
    Pin { id: String },
    /// Delete one memory
    Delete { id: String },
    /// Delete all memories, or all of one type
    Clear {
        #[arg(long = "type")]
        memory_type: Option<MemoryType>,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// List archive files
    Archives,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = TetherConfig::load()?;

    // stdout carries command output; logs go to stderr.
    let filter = EnvFilter::try_new(&config.log.level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let app = App::build(config, Arc::new(NoEntries))?;

    match cli.command {
        Command::Status => cli::status(&app).await?,
        Command::Serve => cli::serve(&app).await?,
        Command::Pull { model } => cli::pull(&app, model.as_deref()).await?,
        Command::Chat {
            message,
            entry,
            no_remember,
        } => cli::chat::chat(&app, &message, entry.as_deref(), !no_remember).await?,
        Command::Remember {
            text,
            importance,
            tags,
        } => cli::memories::remember(&app, &text, importance, tags).await?,
        Command::Recall { query, limit } => cli::memories::recall(&app, &query, limit).await?,
        Command::Memories { action } => match action {
            MemoriesAction::Stats => cli::memories::stats(&app).await?,
            MemoriesAction::Prune => cli::memories::prune(&app).await?,
            MemoriesAction::Pin { id } => cli::memories::pin(&app, &id).await?,
            MemoriesAction::Delete { id } => cli::memories::delete(&app, &id).await?,
            MemoriesAction::Clear { memory_type, yes } => {
                cli::memories::clear(&app, memory_type, yes).await?
            }
            MemoriesAction::Archives => cli::memories::archives(&app).await?,
        },
    }

    Ok(())
}

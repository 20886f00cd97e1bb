//! shelf - inspect and maintain the bot's document store from the command line.

use clap::{Parser, Subcommand};
use serde_json::Value;
use shelf_data::{admin, Config};
use shelf_engine::Store;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shelf", version, about = "Inspect and maintain a shelf document store")]
struct Cli {
    /// Database root (overrides SHELF_DB_ROOT)
    #[arg(long)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show document and shard counts
    Stats { collection: String },
    /// Rebalance shards and delete empty ones
    Optimize { collection: String },
    /// Print matching documents as JSON
    Dump {
        collection: String,
        /// Query object, e.g. '{"ownerId": "123"}'
        #[arg(long)]
        query: Option<String>,
    },
    /// Build an index and report its distinct value count
    Reindex { collection: String, field: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shelf_data=info,shelf_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(root) = cli.root {
        config.db_root = root;
    }
    // One-shot process, nothing to watch
    config.options.watch_files = false;

    tracing::debug!("Opening store at {}", config.db_root.display());
    let store = Store::open(config.db_root.clone(), config.options.clone())?;

    let result = run(&store, cli.command);
    store.close()?;

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run(store: &Store, command: Command) -> shelf_data::Result<Value> {
    match command {
        Command::Stats { collection } => admin::stats(store, &collection),
        Command::Optimize { collection } => admin::optimize(store, &collection),
        Command::Dump { collection, query } => {
            admin::dump(store, &collection, query.as_deref()).map(Value::Array)
        }
        Command::Reindex { collection, field } => admin::reindex(store, &collection, &field),
    }
}

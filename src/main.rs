//! GitDoc command-line interface.
//!
//! Inspects and maintains a store addressed by a `gitdoc://` connection string.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use gitdoc::client::{Client, ConnectionString};
use gitdoc::storage::GitStore;

#[derive(Debug, Parser)]
#[command(name = "gitdoc", version, about = "Git-backed document database")]
struct Cli {
    /// Connection string, e.g. gitdoc:///var/lib/gitdoc/shop
    #[arg(env = "GITDOC_CONNECTION_STRING")]
    connection_string: String,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List collections on main.
    Collections,
    /// Print every document of a collection as JSON lines.
    Dump { collection: String },
    /// Show the first-parent history of main.
    History {
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show store statistics.
    Stats,
    /// Delete session branches left behind by dead processes.
    Cleanup,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "gitdoc=debug" } else { "gitdoc=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let conn = ConnectionString::parse(&cli.connection_string)
        .context("invalid connection string")?;
    let client = Client::connect(&conn)
        .await
        .with_context(|| format!("failed to open store at {}", conn.store_path().display()))?;

    match cli.command {
        Command::Collections => {
            for name in client.database().list_collection_names(None).await? {
                println!("{}", name);
            }
        }
        Command::Dump { collection } => {
            let collection = client.database().collection::<Value>(&collection)?;
            for document in collection.find_all(None).await? {
                println!("{}", serde_json::to_string(&document)?);
            }
        }
        Command::History { limit } => {
            let commits = blocking(&client, move |store| Ok(store.history(limit)?)).await?;
            for commit in commits {
                let marker = if commit.is_merge() { "M" } else { " " };
                println!(
                    "{} {} {} {}",
                    commit.id.short(),
                    marker,
                    commit.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    commit.summary()
                );
            }
        }
        Command::Stats => {
            let stats = blocking(&client, |store| Ok(store.stats()?)).await?;
            println!("{}", stats);
        }
        Command::Cleanup => {
            let cleaned = client.cleanup_abandoned_sessions().await?;
            println!("Removed {} abandoned session branch(es)", cleaned);
        }
    }
    Ok(())
}

async fn blocking<F, T>(client: &Client, f: F) -> Result<T>
where
    F: FnOnce(&GitStore) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = client.store().clone();
    tokio::task::spawn_blocking(move || f(&store)).await?
}

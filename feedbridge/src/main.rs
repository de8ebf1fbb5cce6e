/*
feedbridge - reconciles feed-aggregator entries with an external document
store through a local sync ledger. Batch tool: one invocation, one run.
*/

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use common::Config;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use feedbridge::engine::{SyncEngine, SyncOptions};
use feedbridge::entries::SqlEntrySource;
use feedbridge::ledger::LedgerStore;
use feedbridge::workspace::HttpDocumentStore;

#[derive(Parser, Debug)]
#[command(name = "feedbridge", about = "Feed-to-document-store synchronization tool")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Perform the full five-phase synchronization
    FullSync {
        /// Compute and print diffs without writing
        #[arg(long)]
        dry_run: bool,
        /// Cap the push batch size
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
    },
    /// Sync the document store to the ledger only
    SyncDocument,
    /// Sync feed entries to the ledger only
    SyncFeed,
    /// Push unpushed feed-sourced ledger rows to the document store
    Push {
        #[arg(long)]
        dry_run: bool,
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
        /// Retry previously failed pushes (failed rows stay unpushed, so
        /// this re-runs the same candidate query)
        #[arg(long)]
        retry_failed: bool,
    },
    /// Compare a source against the ledger without writing
    Compare {
        #[arg(long, value_enum)]
        source: CompareSource,
    },
    /// List the document store contents
    CheckDocument,
    /// List the aggregator entries
    CheckFeed,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum CompareSource {
    Document,
    Feed,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Resolve config paths: packaged defaults plus an optional override.
    let default_path = PathBuf::from("config.default.toml");
    let override_path = if let Some(p) = args.config {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() {
            Some(p)
        } else {
            None
        }
    };

    let config = Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    .context("failed to load configuration")?;
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    let engine = build_engine(&config, needs_document_store(&args.command)).await?;

    match args.command {
        Command::FullSync { dry_run, limit } => {
            let report = engine.full_sync(SyncOptions { dry_run, limit }).await?;
            println!("{}", report);
        }
        Command::SyncDocument => {
            let report = engine.sync_document_only().await?;
            println!("{}", report);
        }
        Command::SyncFeed => {
            let report = engine.sync_feed_only().await?;
            println!("{}", report);
        }
        Command::Push { dry_run, limit, retry_failed } => {
            if retry_failed {
                info!("retrying previously failed pushes");
            }
            let report = engine.push_only(SyncOptions { dry_run, limit }).await?;
            println!("{}", report);
        }
        Command::Compare { source } => match source {
            CompareSource::Document => {
                let (new_in_document, missing) = engine.compare_document().await?;
                println!(
                    "Found {} pages in the document store that are not in the ledger.",
                    new_in_document.len()
                );
                println!(
                    "Found {} ledger rows whose document page is missing upstream.",
                    missing.len()
                );
            }
            CompareSource::Feed => {
                let new_entries = engine.compare_feed().await?;
                println!(
                    "Found {} aggregator entries that are not in the ledger.",
                    new_entries.len()
                );
            }
        },
        Command::CheckDocument => {
            let pages = engine.list_document_pages().await?;
            println!("Found {} pages in the document collection.", pages.len());
            for page in pages.iter().take(3) {
                println!("- {} (id: {})", page.title, page.id);
            }
        }
        Command::CheckFeed => {
            let entries = engine.list_feed_entries().await?;
            println!("Found {} entries in the aggregator store.", entries.len());
            for entry in entries.iter().take(3) {
                println!("- {} (id: {})", entry.title, entry.id);
            }
        }
    }

    Ok(())
}

/// Commands that never talk to the document store skip the token lookup
/// and the connection probe.
fn needs_document_store(command: &Command) -> bool {
    !matches!(
        command,
        Command::SyncFeed | Command::CheckFeed | Command::Compare { source: CompareSource::Feed }
    )
}

async fn build_engine(config: &Config, connect_document: bool) -> Result<SyncEngine> {
    let ledger_pool = common::init_db_pool(&config.ledger.path)
        .await
        .context("failed to open ledger database")?;
    let ledger = LedgerStore::new(ledger_pool);
    ledger.ensure_schema().await?;

    let entries_pool = common::init_db_pool(&config.entries.path)
        .await
        .context("failed to open aggregator database")?;
    let entries = SqlEntrySource::new(entries_pool);

    let document = HttpDocumentStore::new(
        &config.document.api_url,
        // The token env var only has to exist when the store is used.
        &if connect_document { config.document.api_token()? } else { String::new() },
        &config.document.database_id,
        config.document.timeout_seconds.unwrap_or(30),
    )?;
    if connect_document {
        document.connect().await?;
    }

    let push_delay = Duration::from_millis(config.document.push_delay_ms.unwrap_or(500));
    Ok(SyncEngine::new(ledger, Box::new(entries), Box::new(document), push_delay))
}

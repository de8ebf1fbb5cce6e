// Development utility: drop and recreate the ledger table from scratch.
// Destructive by design; normal operation only ever migrates additively.

use anyhow::{Context, Result};
use clap::Parser;
use common::Config;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use feedbridge::ledger::LedgerStore;

#[derive(Parser, Debug)]
#[command(name = "reset-ledger", about = "Drop and recreate the feedbridge ledger table")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Skip the confirmation prompt
    #[arg(long)]
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    fmt().with_env_filter(EnvFilter::new("info")).init();

    let default_path = PathBuf::from("config.default.toml");
    let config = Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        args.config.as_deref(),
    )
    .await
    .context("failed to load configuration")?;

    if !args.yes {
        println!(
            "This will DROP the ledger table in {} and recreate it empty.",
            config.ledger.path
        );
        println!("Type 'yes' to continue:");
        let mut answer = String::new();
        std::io::stdin()
            .read_line(&mut answer)
            .context("failed to read confirmation")?;
        if answer.trim() != "yes" {
            println!("Aborted.");
            return Ok(());
        }
    }

    let pool = common::init_db_pool(&config.ledger.path)
        .await
        .context("failed to open ledger database")?;
    let ledger = LedgerStore::new(pool);
    ledger.reset_schema().await?;
    info!("ledger table dropped and recreated");
    Ok(())
}

/*!
common/src/lib.rs

Shared configuration types and DB helper functions for feedbridge.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader for a TOML config file with default/override merging
- A helper to initialize an SQLite connection pool
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Location of the feed aggregator's database (read-only for us)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntriesConfig {
    /// Path to the aggregator's sqlite database file holding the `entries` table
    pub path: String,
}

/// Location of the ledger database (owned by feedbridge)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Path to the sqlite database file (e.g. "data/feedbridge.db")
    pub path: String,
}

/// Document store (external collaborative-document API) configuration.
///
/// The API token is never stored in the config file; `api_token_env` names
/// the environment variable it is read from at process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentConfig {
    /// Base URL of the document store API, e.g. "https://api.example.com/v1"
    pub api_url: String,
    /// Name of the env var holding the bearer token
    pub api_token_env: String,
    /// Id of the collection (database) holding the pages we reconcile with
    pub database_id: String,
    pub timeout_seconds: Option<u64>,
    /// Fixed delay between page-create calls, to stay under the store's rate ceiling
    pub push_delay_ms: Option<u64>,
}

impl DocumentConfig {
    /// Resolve the API token from the environment variable named in the config.
    pub fn api_token(&self) -> Result<String> {
        std::env::var(&self.api_token_env)
            .with_context(|| format!("document API token env var '{}' not set", self.api_token_env))
    }
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub entries: EntriesConfig,
    pub ledger: LedgerConfig,
    pub document: DocumentConfig,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        if let Some(path) = default_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path).await
                    .with_context(|| format!("Failed to read default config: {}", path.display()))?;
                let val: toml::Value = toml::from_str(&data)
                    .context("Failed to parse default configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        if let Some(path) = override_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path).await
                    .with_context(|| format!("Failed to read override config: {}", path.display()))?;
                let val: toml::Value = toml::from_str(&data)
                    .context("Failed to parse override configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        Ok(cfg)
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Initialize an SQLite connection pool.
///
/// This function will create the parent directory if necessary, ensure the DB file exists
/// (attempting to create it if missing), and return a configured `SqlitePool`. Defaults are
/// conservative: the reconciliation run is single-writer, so a small pool suffices.
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    // Try to create the DB file if it does not already exist. This gives a clearer error
    // earlier (filesystem permission or path issues) instead of only surfacing it via the
    // SQLite connection attempt.
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to create or open DB file: {}", path))?;

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::SystemTime;

    #[tokio::test]
    async fn config_from_string_and_db_pool() {
        // Minimal TOML to test parsing
        let toml = r#"
            [entries]
            path = "data/aggregator.db"

            [ledger]
            path = "data/feedbridge.db"

            [document]
            api_url = "https://api.example.com/v1"
            api_token_env = "FEEDBRIDGE_DOCUMENT_TOKEN"
            database_id = "abc123"
        "#;

        let cfg: Config = toml::from_str(toml).expect("parse config");
        assert_eq!(cfg.ledger.path, "data/feedbridge.db");
        assert_eq!(cfg.document.api_token_env, "FEEDBRIDGE_DOCUMENT_TOKEN");
        assert!(cfg.document.push_delay_ms.is_none());

        // Test DB pool initialization in a temporary directory under the OS temp dir
        let now = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time")
            .as_millis();
        let dir = std::env::temp_dir().join(format!("feedbridge_test_{}", now));
        let _ = fs::create_dir_all(&dir);
        let db_path = dir.join("feedbridge.db");
        let db_path_str = db_path.to_string_lossy().to_string();

        let pool = init_db_pool(&db_path_str).await.expect("init pool");
        let conn = pool.acquire().await.expect("acquire conn");
        drop(conn);
    }

    #[test]
    fn override_wins_on_merge() {
        let mut base: toml::Value = toml::from_str(
            r#"
            [ledger]
            path = "data/default.db"

            [document]
            api_url = "https://api.example.com/v1"
            "#,
        )
        .unwrap();
        let over: toml::Value = toml::from_str(
            r#"
            [ledger]
            path = "data/override.db"
            "#,
        )
        .unwrap();
        merge_toml(&mut base, over);
        let ledger = base.get("ledger").and_then(|l| l.get("path")).unwrap();
        assert_eq!(ledger.as_str(), Some("data/override.db"));
        // untouched sections survive the merge
        assert!(base.get("document").is_some());
    }
}

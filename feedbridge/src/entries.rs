//! Entry Source Adapter: read-only access to the feed aggregator's
//! `entries` table. The aggregator owns that table; we never mutate it.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::error::SyncError;

/// Immutable snapshot of one aggregator entry.
#[derive(Debug, Clone)]
pub struct FeedEntry {
    pub id: i64,
    pub title: String,
    pub link: String,
    /// HTML or plain content as stored by the aggregator
    pub content: String,
    pub author: Option<String>,
    /// date_entered upstream
    pub published: DateTime<Utc>,
    /// date_updated upstream
    pub updated: DateTime<Utc>,
}

/// Read-side contract of the aggregator store.
#[async_trait]
pub trait EntrySource: Send + Sync {
    /// All entries, newest-updated first. A connection-level failure here
    /// is fatal for the sync run.
    async fn list_entries(&self) -> Result<Vec<FeedEntry>>;

    /// Look a single entry up by exact title, used for ledger content
    /// backfill when a document page arrived with an empty body.
    async fn find_by_title(&self, title: &str) -> Result<Option<FeedEntry>>;
}

/// `EntrySource` over the aggregator's SQLite database.
pub struct SqlEntrySource {
    pool: SqlitePool,
}

impl SqlEntrySource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> FeedEntry {
    FeedEntry {
        id: row.get("id"),
        title: row.get("title"),
        link: row.get("link"),
        content: row.get("content"),
        author: row.get("author"),
        published: row.get("date_entered"),
        updated: row.get("date_updated"),
    }
}

#[async_trait]
impl EntrySource for SqlEntrySource {
    async fn list_entries(&self) -> Result<Vec<FeedEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, link, content, author, date_entered, date_updated
            FROM entries
            ORDER BY date_updated DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::SourceUnavailable(format!("aggregator entries query failed: {e}")))?;

        let entries: Vec<FeedEntry> = rows.iter().map(row_to_entry).collect();
        info!("Retrieved {} entries from aggregator store", entries.len());
        Ok(entries)
    }

    async fn find_by_title(&self, title: &str) -> Result<Option<FeedEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, link, content, author, date_entered, date_updated
            FROM entries
            WHERE title = ?
            LIMIT 1
            "#,
        )
        .bind(title)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::SourceUnavailable(format!("aggregator title lookup failed: {e}")))?;

        Ok(row.as_ref().map(row_to_entry))
    }
}

/// Create the `entries` table if missing. The real table belongs to the
/// aggregator; this exists for tests and local development databases.
pub async fn ensure_entries_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            link TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            author TEXT,
            date_entered TIMESTAMP NOT NULL,
            date_updated TIMESTAMP NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

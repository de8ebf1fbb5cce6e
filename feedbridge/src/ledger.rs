//! Ledger Store: the local reconciliation table holding the merged,
//! de-duplicated view of aggregator entries and document pages.
//!
//! For matching purposes a record is identified by its (title, link)
//! natural key, not the surrogate id; duplicate lookups additionally match
//! on the source-specific id so the same article arriving once via its
//! feed id and later via its document id collapses to one row.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::entries::{EntrySource, FeedEntry};
use crate::normalize;
use crate::workspace::DocumentPage;

/// Which upstream currently supplies a ledger row's authoritative content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Feed,
    Document,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Feed => "feed",
            SourceKind::Document => "document",
        }
    }

    /// Values are only ever written by this crate, so anything that is not
    /// "document" is treated as feed.
    pub fn parse(s: &str) -> SourceKind {
        match s {
            "document" => SourceKind::Document,
            _ => SourceKind::Feed,
        }
    }
}

/// One reconciled row of the ledger table.
#[derive(Debug, Clone)]
pub struct LedgerRecord {
    pub id: i64,
    pub feed_entry_id: Option<i64>,
    pub document_page_id: Option<String>,
    pub title: String,
    pub content: String,
    pub category: Option<String>,
    /// JSON array text of tags, NULL when the record carries none
    pub tag: Option<String>,
    pub summary: Option<String>,
    pub rationale: Option<String>,
    pub link: String,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub source: SourceKind,
    pub pushed: bool,
    pub last_push: Option<DateTime<Utc>>,
}

impl LedgerRecord {
    /// Decode the stored tag list.
    pub fn tags(&self) -> Vec<String> {
        self.tag
            .as_deref()
            .and_then(|t| serde_json::from_str(t).ok())
            .unwrap_or_default()
    }
}

const RECORD_COLUMNS: &str = "id, feed_entry_id, document_page_id, title, content, category, tag, \
                              summary, rationale, link, published, updated, source, pushed, last_push";

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> LedgerRecord {
    let source: String = row.get("source");
    LedgerRecord {
        id: row.get("id"),
        feed_entry_id: row.get("feed_entry_id"),
        document_page_id: row.get("document_page_id"),
        title: row.get("title"),
        content: row.get("content"),
        category: row.get("category"),
        tag: row.get("tag"),
        summary: row.get("summary"),
        rationale: row.get("rationale"),
        link: row.get("link"),
        published: row.get("published"),
        updated: row.get("updated"),
        source: SourceKind::parse(&source),
        pushed: row.get("pushed"),
        last_push: row.get("last_push"),
    }
}

fn tags_to_column(tags: &[String]) -> Option<String> {
    if tags.is_empty() {
        None
    } else {
        serde_json::to_string(tags).ok()
    }
}

/// Owns all reads and writes of the `ledger` table. One store (and one
/// pool) per run; all writes are serialized through it.
pub struct LedgerStore {
    pool: SqlitePool,
}

impl LedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Ensure the ledger table exists, applying additive column migrations
    /// to existing deployments. Idempotent and safe to call at startup.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                feed_entry_id INTEGER,
                document_page_id TEXT,
                title TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                category TEXT,
                tag TEXT,
                summary TEXT,
                rationale TEXT,
                link TEXT NOT NULL DEFAULT '',
                published TIMESTAMP,
                updated TIMESTAMP,
                source TEXT NOT NULL,
                pushed BOOLEAN NOT NULL DEFAULT FALSE,
                last_push TIMESTAMP
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create ledger table")?;

        // Deployments created before the enrichment fields existed get the
        // new nullable columns appended; never destructive.
        for column in ["category", "tag", "summary", "rationale"] {
            let present = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM pragma_table_info('ledger') WHERE name = ?",
            )
            .bind(column)
            .fetch_one(&self.pool)
            .await
            .unwrap_or(0)
                > 0;
            if !present {
                info!("ledger: adding missing column '{}'", column);
                sqlx::query(&format!("ALTER TABLE ledger ADD COLUMN {} TEXT", column))
                    .execute(&self.pool)
                    .await
                    .with_context(|| format!("failed to add ledger column {}", column))?;
            }
        }
        Ok(())
    }

    /// Drop and recreate the ledger table. Development use only.
    pub async fn reset_schema(&self) -> Result<()> {
        sqlx::query("DROP TABLE IF EXISTS ledger")
            .execute(&self.pool)
            .await
            .context("failed to drop ledger table")?;
        self.ensure_schema().await
    }

    /// Find an existing row matching a candidate by exact (title, link)
    /// equality, or by the source-specific id when one is supplied.
    pub async fn find_duplicate(
        &self,
        title: &str,
        link: &str,
        kind: SourceKind,
        feed_entry_id: Option<i64>,
        document_page_id: Option<&str>,
    ) -> Result<Option<LedgerRecord>> {
        let row = match kind {
            SourceKind::Feed if feed_entry_id.is_some() => {
                sqlx::query(&format!(
                    "SELECT {RECORD_COLUMNS} FROM ledger \
                     WHERE (title = ? AND link = ?) OR feed_entry_id = ?"
                ))
                .bind(title)
                .bind(link)
                .bind(feed_entry_id)
                .fetch_optional(&self.pool)
                .await
            }
            SourceKind::Document if document_page_id.is_some() => {
                sqlx::query(&format!(
                    "SELECT {RECORD_COLUMNS} FROM ledger \
                     WHERE (title = ? AND link = ?) OR document_page_id = ?"
                ))
                .bind(title)
                .bind(link)
                .bind(document_page_id)
                .fetch_optional(&self.pool)
                .await
            }
            _ => {
                sqlx::query(&format!(
                    "SELECT {RECORD_COLUMNS} FROM ledger WHERE title = ? AND link = ?"
                ))
                .bind(title)
                .bind(link)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .context("duplicate lookup failed")?;

        Ok(row.as_ref().map(row_to_record))
    }

    /// Insert a feed entry as a new ledger row. No-op returning the
    /// existing id if a duplicate is already present. Content is run
    /// through HTML-to-text normalization on the way in.
    pub async fn insert_from_feed(&self, entry: &FeedEntry) -> Result<i64> {
        if let Some(existing) = self
            .find_duplicate(&entry.title, &entry.link, SourceKind::Feed, Some(entry.id), None)
            .await?
        {
            debug!(
                "skipping duplicate feed entry {} ('{}'), ledger row {}",
                entry.id, entry.title, existing.id
            );
            return Ok(existing.id);
        }

        let content = normalize::normalize_content(&entry.content);
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO ledger (feed_entry_id, title, content, link, published, updated, source, pushed)
            VALUES (?, ?, ?, ?, ?, ?, 'feed', FALSE)
            RETURNING id
            "#,
        )
        .bind(entry.id)
        .bind(&entry.title)
        .bind(&content)
        .bind(&entry.link)
        .bind(entry.published)
        .bind(entry.updated)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert feed entry into ledger")?;

        debug!("added feed entry {} to ledger as row {}", entry.id, id);
        Ok(id)
    }

    /// Insert a document page as a new ledger row. Document data always
    /// wins on conflict: an existing duplicate is deleted and replaced
    /// rather than merged (the duplicate's feed id is carried over so the
    /// feed linkage survives the replacement).
    ///
    /// A page arriving with an empty body gets its content backfilled from
    /// a same-title feed-sourced ledger row, then from the entry source
    /// directly; a successful backfill retags the row source=feed, since
    /// provenance of the content, not the arrival path, determines the
    /// source tag.
    pub async fn insert_from_document(
        &self,
        page: &DocumentPage,
        entry_source: &dyn EntrySource,
    ) -> Result<i64> {
        let dup = self
            .find_duplicate(&page.title, &page.link, SourceKind::Document, None, Some(&page.id))
            .await?;

        let mut content = page.content.clone();
        let mut source = SourceKind::Document;
        let mut feed_entry_id = dup.as_ref().and_then(|d| d.feed_entry_id);

        if content.trim().is_empty() {
            if let Some(feed_row) = self.find_feed_row_by_title(&page.title).await? {
                if !feed_row.content.trim().is_empty() {
                    info!(
                        "backfilling document page {} from ledger feed row {}",
                        page.id, feed_row.id
                    );
                    content = feed_row.content.clone();
                    source = SourceKind::Feed;
                    feed_entry_id = feed_entry_id.or(feed_row.feed_entry_id);
                }
            }
            if content.trim().is_empty() {
                if let Some(entry) = entry_source.find_by_title(&page.title).await? {
                    let normalized = normalize::normalize_content(&entry.content);
                    if !normalized.trim().is_empty() {
                        info!("backfilling document page {} from aggregator entry {}", page.id, entry.id);
                        content = normalized;
                        source = SourceKind::Feed;
                        feed_entry_id = feed_entry_id.or(Some(entry.id));
                    }
                }
            }
        }

        if let Some(existing) = &dup {
            debug!(
                "replacing ledger row {} with document page {} (document wins)",
                existing.id, page.id
            );
            self.delete_record(existing.id).await?;
        }

        // Document-origin rows are definitionally already in the store.
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO ledger (feed_entry_id, document_page_id, title, content, category, tag,
                                summary, rationale, link, published, updated, source, pushed)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, TRUE)
            RETURNING id
            "#,
        )
        .bind(feed_entry_id)
        .bind(&page.id)
        .bind(&page.title)
        .bind(&content)
        .bind(&page.category)
        .bind(tags_to_column(&page.tags))
        .bind(&page.summary)
        .bind(&page.rationale)
        .bind(&page.link)
        .bind(page.published)
        .bind(page.updated)
        .bind(source.as_str())
        .fetch_one(&self.pool)
        .await
        .context("failed to insert document page into ledger")?;

        debug!("added document page {} to ledger as row {}", page.id, id);
        Ok(id)
    }

    /// Record a successful push: attach the new page id, flip the pushed
    /// flag and stamp the push time.
    pub async fn mark_pushed(&self, id: i64, document_page_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE ledger SET document_page_id = ?, pushed = TRUE, last_push = ? WHERE id = ?",
        )
        .bind(document_page_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update push status for ledger row {}", id))?;
        Ok(())
    }

    /// Entries not yet represented in the ledger, by natural key and by
    /// feed id (document-tagged natural-key matches count as represented).
    pub async fn diff_against_feed(&self, entries: &[FeedEntry]) -> Result<Vec<FeedEntry>> {
        let rows = sqlx::query("SELECT title, link, feed_entry_id FROM ledger")
            .fetch_all(&self.pool)
            .await
            .context("failed to read ledger keys")?;

        let mut keys: HashSet<(String, String)> = HashSet::new();
        let mut feed_ids: HashSet<i64> = HashSet::new();
        for row in &rows {
            keys.insert((row.get("title"), row.get("link")));
            if let Some(fid) = row.get::<Option<i64>, _>("feed_entry_id") {
                feed_ids.insert(fid);
            }
        }

        let missing: Vec<FeedEntry> = entries
            .iter()
            .filter(|e| {
                !feed_ids.contains(&e.id) && !keys.contains(&(e.title.clone(), e.link.clone()))
            })
            .cloned()
            .collect();
        info!("found {} aggregator entries not yet in ledger", missing.len());
        Ok(missing)
    }

    /// Rows waiting to be pushed to the document store.
    pub async fn find_push_candidates(&self) -> Result<Vec<LedgerRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM ledger \
             WHERE source = 'feed' AND pushed = FALSE ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to query push candidates")?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    /// Repair title collisions left behind when both adapters discovered
    /// the same article independently: backfill empty document-row content
    /// from the feed side, carry the feed linkage onto the document row and
    /// delete the redundant feed rows. A page id only ever stays attached
    /// to one row, so a later document refresh cannot fan out over two
    /// rows. Idempotent.
    ///
    /// Returns the number of feed rows folded into their document twin.
    pub async fn reconcile_duplicate_titles(&self, entry_source: &dyn EntrySource) -> Result<u64> {
        let titles: Vec<String> =
            sqlx::query_scalar("SELECT title FROM ledger GROUP BY title HAVING COUNT(*) > 1")
                .fetch_all(&self.pool)
                .await
                .context("failed to list duplicate titles")?;

        let mut folded = 0u64;
        let mut backfilled = 0u64;

        for title in &titles {
            let document_rows = self.rows_by_title_and_source(title, SourceKind::Document).await?;
            let feed_rows = sqlx::query(&format!(
                "SELECT {RECORD_COLUMNS} FROM ledger \
                 WHERE title = ? AND source = 'feed' AND pushed = FALSE"
            ))
            .bind(title)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(row_to_record)
            .collect::<Vec<_>>();

            let (Some(document_row), false) = (document_rows.first(), feed_rows.is_empty()) else {
                continue;
            };

            if document_row.content.trim().is_empty() {
                let feed_content = feed_rows
                    .iter()
                    .map(|r| r.content.as_str())
                    .find(|c| !c.trim().is_empty())
                    .map(str::to_string);
                let content = match feed_content {
                    Some(c) => Some(c),
                    None => entry_source
                        .find_by_title(title)
                        .await?
                        .map(|e| normalize::normalize_content(&e.content))
                        .filter(|c| !c.trim().is_empty()),
                };
                if let Some(content) = content {
                    sqlx::query("UPDATE ledger SET content = ?, source = 'feed' WHERE id = ?")
                        .bind(&content)
                        .bind(document_row.id)
                        .execute(&self.pool)
                        .await?;
                    backfilled += 1;
                    info!(
                        "backfilled document row {} with feed content for title '{}'",
                        document_row.id, title
                    );
                }
            }

            // The rows represent the same logical entry: keep the document
            // row, take the feed linkage from the copies, drop the copies.
            if document_row.feed_entry_id.is_none() {
                if let Some(fid) = feed_rows.iter().find_map(|r| r.feed_entry_id) {
                    sqlx::query("UPDATE ledger SET feed_entry_id = ? WHERE id = ?")
                        .bind(fid)
                        .bind(document_row.id)
                        .execute(&self.pool)
                        .await?;
                }
            }
            for feed_row in &feed_rows {
                self.delete_record(feed_row.id).await?;
                folded += 1;
            }
            info!(
                "folded {} feed rows into document row {} for title '{}'",
                feed_rows.len(),
                document_row.id,
                title
            );
        }

        // Final pass: any remaining document row with an empty body gets a
        // chance at content from the aggregator directly.
        let empty_rows = sqlx::query("SELECT id, title FROM ledger WHERE source = 'document' AND (content IS NULL OR content = '')")
            .fetch_all(&self.pool)
            .await?;
        for row in &empty_rows {
            let id: i64 = row.get("id");
            let title: String = row.get("title");
            if let Some(entry) = entry_source.find_by_title(&title).await? {
                let content = normalize::normalize_content(&entry.content);
                if !content.trim().is_empty() {
                    sqlx::query("UPDATE ledger SET content = ?, source = 'feed' WHERE id = ?")
                        .bind(&content)
                        .bind(id)
                        .execute(&self.pool)
                        .await?;
                    backfilled += 1;
                    info!("backfilled empty document row {} from aggregator entry {}", id, entry.id);
                }
            }
        }

        if folded > 0 || backfilled > 0 {
            info!(
                "title reconciliation folded {} feed rows, backfilled {} document rows",
                folded, backfilled
            );
        }
        Ok(folded)
    }

    /// Refresh feed-backed rows whose upstream entry has a newer
    /// updated-at: overwrite title/content/link/updated, preserving the
    /// enrichment fields the feed knows nothing about.
    pub async fn update_feed_backed(&self, entries: &[FeedEntry]) -> Result<u64> {
        let by_id: HashMap<i64, &FeedEntry> = entries.iter().map(|e| (e.id, e)).collect();

        let rows = sqlx::query(
            "SELECT id, feed_entry_id, updated FROM ledger \
             WHERE source = 'feed' AND feed_entry_id IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list feed-backed ledger rows")?;

        let mut updated = 0u64;
        for row in &rows {
            let id: i64 = row.get("id");
            let fid: i64 = row.get("feed_entry_id");
            let row_updated: Option<DateTime<Utc>> = row.get("updated");
            let Some(entry) = by_id.get(&fid) else {
                // upstream entry vanished from the feed; the row stays
                continue;
            };
            if row_updated.map_or(true, |u| entry.updated > u) {
                let content = normalize::normalize_content(&entry.content);
                let result = sqlx::query(
                    "UPDATE ledger SET title = ?, content = ?, link = ?, updated = ? WHERE id = ?",
                )
                .bind(&entry.title)
                .bind(&content)
                .bind(&entry.link)
                .bind(entry.updated)
                .bind(id)
                .execute(&self.pool)
                .await;
                match result {
                    Ok(_) => updated += 1,
                    Err(e) => warn!("failed to refresh ledger row {} from feed entry {}: {}", id, fid, e),
                }
            }
        }
        Ok(updated)
    }

    /// Overwrite the row carrying this page id with the page's current
    /// values. The document side is authoritative; no timestamp compare.
    pub async fn refresh_from_document(&self, page: &DocumentPage) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE ledger SET title = ?, link = ?, content = ?, category = ?, tag = ?, \
             summary = ?, rationale = ?, updated = ? WHERE document_page_id = ?",
        )
        .bind(&page.title)
        .bind(&page.link)
        .bind(&page.content)
        .bind(&page.category)
        .bind(tags_to_column(&page.tags))
        .bind(&page.summary)
        .bind(&page.rationale)
        .bind(page.updated)
        .bind(&page.id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to refresh ledger from document page {}", page.id))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_record(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM ledger WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete ledger row {}", id))?;
        debug!("deleted ledger row {}", id);
        Ok(())
    }

    /// All rows, newest-updated first.
    pub async fn list_records(&self) -> Result<Vec<LedgerRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM ledger ORDER BY updated DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to list ledger rows")?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    /// Document page ids currently attached to ledger rows.
    pub async fn document_page_ids(&self) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT document_page_id FROM ledger WHERE document_page_id IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list ledger document page ids")?;
        Ok(ids.into_iter().collect())
    }

    async fn rows_by_title_and_source(
        &self,
        title: &str,
        source: SourceKind,
    ) -> Result<Vec<LedgerRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM ledger WHERE title = ? AND source = ?"
        ))
        .bind(title)
        .bind(source.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn find_feed_row_by_title(&self, title: &str) -> Result<Option<LedgerRecord>> {
        let rows = self.rows_by_title_and_source(title, SourceKind::Feed).await?;
        Ok(rows.into_iter().next())
    }
}

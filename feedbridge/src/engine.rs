//! Reconciliation Engine: the five-phase batch pipeline that keeps the
//! ledger consistent with both sources and pushes ledger-only feed rows
//! out to the document store.
//!
//! Phases run in strict order because later steps assume earlier steps'
//! invariants. There is no resume point: each invocation recomputes diffs
//! from current committed state, which is safe because every phase is
//! idempotent given stable inputs.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::entries::{EntrySource, FeedEntry};
use crate::ledger::{LedgerRecord, LedgerStore, SourceKind};
use crate::workspace::{DocumentPage, DocumentStore};

/// Per-run counters, printed as the sync summary.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub added_from_document: u64,
    pub updated_from_document: u64,
    pub removed_from_ledger: u64,
    pub added_from_feed: u64,
    pub updated_from_feed: u64,
    pub title_collisions_repaired: u64,
    pub pushed_to_document: u64,
    pub push_failures: u64,
    pub item_errors: u64,
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sync summary:")?;
        writeln!(f, "- Added from document store: {}", self.added_from_document)?;
        writeln!(f, "- Updated from document store: {}", self.updated_from_document)?;
        writeln!(f, "- Removed from ledger: {}", self.removed_from_ledger)?;
        writeln!(f, "- Added from feed: {}", self.added_from_feed)?;
        writeln!(f, "- Updated from feed: {}", self.updated_from_feed)?;
        writeln!(f, "- Title collisions repaired: {}", self.title_collisions_repaired)?;
        writeln!(f, "- Pushed to document store: {}", self.pushed_to_document)?;
        writeln!(f, "- Push failures: {}", self.push_failures)?;
        write!(f, "- Item errors: {}", self.item_errors)
    }
}

/// Options shared by the sync entry points.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Compute and log diffs without writing anywhere.
    pub dry_run: bool,
    /// Cap on the number of pages pushed in one run.
    pub limit: Option<usize>,
}

/// Drives the three stores. Holds one ledger store for the duration of a
/// run; all work is sequential.
pub struct SyncEngine {
    ledger: LedgerStore,
    entries: Box<dyn EntrySource>,
    documents: Box<dyn DocumentStore>,
    push_delay: Duration,
}

impl SyncEngine {
    pub fn new(
        ledger: LedgerStore,
        entries: Box<dyn EntrySource>,
        documents: Box<dyn DocumentStore>,
        push_delay: Duration,
    ) -> Self {
        Self {
            ledger,
            entries,
            documents,
            push_delay,
        }
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    /// Full sync: document snapshot, document->ledger, feed->ledger,
    /// title-collision repair, push. Document phase runs before the feed
    /// phase by design, so the repair phase sees both sides' inserts.
    pub async fn full_sync(&self, opts: SyncOptions) -> Result<SyncReport> {
        if opts.dry_run {
            return self.dry_run_report().await;
        }

        let mut report = SyncReport::default();

        info!("phase 1: pulling document snapshot");
        let pages = self.pull_document_snapshot(&mut report).await?;

        info!("phase 2: syncing document store to ledger");
        self.sync_document_to_ledger(&pages, &mut report).await?;

        info!("phase 3: syncing feed entries to ledger");
        self.sync_feed_to_ledger(&mut report).await?;

        info!("phase 4: repairing title collisions");
        report.title_collisions_repaired =
            self.ledger.reconcile_duplicate_titles(self.entries.as_ref()).await?;

        info!("phase 5: pushing to document store");
        self.push_to_document(opts.limit, &mut report).await?;

        Ok(report)
    }

    /// Phase 1: authoritative snapshot of the document side for this run.
    /// A body fetch failure keeps the page with property-derived (empty)
    /// content rather than dropping it.
    pub async fn pull_document_snapshot(&self, report: &mut SyncReport) -> Result<Vec<DocumentPage>> {
        let mut pages = self.documents.list_pages().await?;
        for page in &mut pages {
            match self.documents.fetch_page_body(&page.id).await {
                Ok(body) => page.content = body,
                Err(e) => {
                    warn!("could not fetch body of page {}: {}", page.id, e);
                    report.item_errors += 1;
                }
            }
        }
        Ok(pages)
    }

    /// Phase 2: the document store is the source of truth for its own
    /// pages. New pages are inserted (with content backfill), existing
    /// rows refreshed unconditionally, and document-sourced rows whose
    /// page vanished upstream are deleted. Feed-sourced rows are never
    /// deleted here.
    pub async fn sync_document_to_ledger(
        &self,
        pages: &[DocumentPage],
        report: &mut SyncReport,
    ) -> Result<()> {
        let known_ids = self.ledger.document_page_ids().await?;

        for page in pages {
            if known_ids.contains(&page.id) {
                match self.ledger.refresh_from_document(page).await {
                    Ok(true) => report.updated_from_document += 1,
                    Ok(false) => {}
                    Err(e) => {
                        error!("failed to refresh ledger from page {}: {}", page.id, e);
                        report.item_errors += 1;
                    }
                }
            } else {
                match self.ledger.insert_from_document(page, self.entries.as_ref()).await {
                    Ok(_) => report.added_from_document += 1,
                    Err(e) => {
                        error!("failed to insert page {} into ledger: {}", page.id, e);
                        report.item_errors += 1;
                    }
                }
            }
        }

        // Orphaned document rows: the backing page was archived upstream.
        let current_ids: std::collections::HashSet<&str> =
            pages.iter().map(|p| p.id.as_str()).collect();
        for record in self.ledger.list_records().await? {
            if record.source == SourceKind::Document {
                if let Some(page_id) = &record.document_page_id {
                    if !current_ids.contains(page_id.as_str()) {
                        info!(
                            "removing ledger row {} ('{}'), page {} gone upstream",
                            record.id, record.title, page_id
                        );
                        match self.ledger.delete_record(record.id).await {
                            Ok(()) => report.removed_from_ledger += 1,
                            Err(e) => {
                                error!("failed to delete ledger row {}: {}", record.id, e);
                                report.item_errors += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Phase 3: insert the natural-key diff from the feed, then refresh
    /// feed-backed rows whose upstream changed. Feed rows are never
    /// deleted, even when the upstream entry disappears; editorial
    /// curation lives in the document store.
    pub async fn sync_feed_to_ledger(&self, report: &mut SyncReport) -> Result<()> {
        let entries = self.entries.list_entries().await?;
        let missing = self.ledger.diff_against_feed(&entries).await?;
        for entry in &missing {
            match self.ledger.insert_from_feed(entry).await {
                Ok(_) => report.added_from_feed += 1,
                Err(e) => {
                    error!("failed to insert feed entry {} into ledger: {}", entry.id, e);
                    report.item_errors += 1;
                }
            }
        }
        report.updated_from_feed = self.ledger.update_feed_backed(&entries).await?;
        Ok(())
    }

    /// Phase 5: create one page per candidate, newest candidates last.
    /// Failures leave pushed=false so the row is retried on a later run;
    /// a fixed delay between calls respects the store's rate ceiling.
    pub async fn push_to_document(
        &self,
        limit: Option<usize>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let mut candidates = self.ledger.find_push_candidates().await?;
        if let Some(limit) = limit {
            if candidates.len() > limit {
                info!("limiting push batch to {} of {} candidates", limit, candidates.len());
                candidates.truncate(limit);
            }
        }

        for record in &candidates {
            match self.documents.create_page(record).await {
                Ok(page_id) => match self.ledger.mark_pushed(record.id, &page_id).await {
                    Ok(()) => report.pushed_to_document += 1,
                    Err(e) => {
                        // The page now exists upstream while the row still
                        // reads unpushed; a later run will recreate it.
                        error!(
                            "page {} created but ledger row {} not marked pushed: {}",
                            page_id, record.id, e
                        );
                        report.item_errors += 1;
                    }
                },
                Err(e) => {
                    error!("push of ledger row {} failed: {}", record.id, e);
                    report.push_failures += 1;
                }
            }
            tokio::time::sleep(self.push_delay).await;
        }

        if report.pushed_to_document > 0 || report.push_failures > 0 {
            info!(
                "pushed {} records to document store ({} failures)",
                report.pushed_to_document, report.push_failures
            );
        }
        Ok(())
    }

    /// Document-only entry point: phases 1-2.
    pub async fn sync_document_only(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let pages = self.pull_document_snapshot(&mut report).await?;
        self.sync_document_to_ledger(&pages, &mut report).await?;
        Ok(report)
    }

    /// Feed-only entry point: phase 3.
    pub async fn sync_feed_only(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        self.sync_feed_to_ledger(&mut report).await?;
        Ok(report)
    }

    /// Push-only entry point: phase 5 (candidates already reflect any
    /// earlier failed pushes, so this doubles as the retry path).
    pub async fn push_only(&self, opts: SyncOptions) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        if opts.dry_run {
            let candidates = self.ledger.find_push_candidates().await?;
            info!("dry run: {} records would be pushed", candidates.len());
            for record in candidates.iter().take(10) {
                info!("dry run: would push '{}'", record.title);
            }
            return Ok(report);
        }
        self.push_to_document(opts.limit, &mut report).await?;
        Ok(report)
    }

    /// Diff the document store against the ledger without writing:
    /// (new in document, document-sourced ledger rows missing upstream).
    pub async fn compare_document(&self) -> Result<(Vec<DocumentPage>, Vec<LedgerRecord>)> {
        let pages = self.documents.list_pages().await?;
        let known_ids = self.ledger.document_page_ids().await?;
        let new_in_document: Vec<DocumentPage> = pages
            .iter()
            .filter(|p| !known_ids.contains(&p.id))
            .cloned()
            .collect();

        let current_ids: std::collections::HashSet<&str> =
            pages.iter().map(|p| p.id.as_str()).collect();
        let missing_from_document: Vec<LedgerRecord> = self
            .ledger
            .list_records()
            .await?
            .into_iter()
            .filter(|r| {
                r.source == SourceKind::Document
                    && r.document_page_id
                        .as_deref()
                        .map_or(false, |id| !current_ids.contains(id))
            })
            .collect();

        info!(
            "found {} new pages in document store, {} ledger rows missing upstream",
            new_in_document.len(),
            missing_from_document.len()
        );
        Ok((new_in_document, missing_from_document))
    }

    /// Diff the feed against the ledger without writing.
    pub async fn compare_feed(&self) -> Result<Vec<FeedEntry>> {
        let entries = self.entries.list_entries().await?;
        self.ledger.diff_against_feed(&entries).await
    }

    /// List the feed side (for the check command).
    pub async fn list_feed_entries(&self) -> Result<Vec<FeedEntry>> {
        self.entries.list_entries().await
    }

    /// List the document side (for the check command).
    pub async fn list_document_pages(&self) -> Result<Vec<DocumentPage>> {
        self.documents.list_pages().await
    }

    /// Dry-run analysis for full-sync: log what each phase would do.
    async fn dry_run_report(&self) -> Result<SyncReport> {
        let (new_in_document, missing_from_document) = self.compare_document().await?;
        let new_from_feed = self.compare_feed().await?;
        let candidates = self.ledger.find_push_candidates().await?;
        info!(
            "dry run: {} pages would be added from the document store, {} ledger rows removed, \
             {} entries added from the feed, {} records pushed",
            new_in_document.len(),
            missing_from_document.len(),
            new_from_feed.len(),
            candidates.len()
        );
        Ok(SyncReport::default())
    }
}

//! Error taxonomy for the reconciliation pipeline.
//!
//! Connection-level failures (`SourceUnavailable`) are fatal to the current
//! run and propagate out of `main` with a nonzero exit. Per-item failures
//! (a single write, a single page create) are logged and counted by the
//! engine and never abort a batch.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The feed store or the document store could not be reached at all.
    /// Aborts the current run; already-committed records are untouched.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A page-create call failed (rate limit, schema drift, oversized
    /// payload). The ledger row keeps pushed=false and is retried later.
    #[error("push failed for ledger record {id}: {reason}")]
    PushFailure { id: i64, reason: String },

    /// HTML-to-text or block-splitting failed. Callers fall back to
    /// passing the original content through unmodified.
    #[error("content conversion failed: {0}")]
    ConversionFailure(String),
}

use crate::multiplex::Partition;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// One partition's fetch resolver failed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableError {
    pub table: String,
    pub partition: Partition,
    pub error: String,
}

/// One item or one column failed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowError {
    pub table: String,
    pub partition: Partition,
    /// `None` when the whole item failed (pre-resource resolver, validation)
    pub column: Option<String>,
    pub error: String,
}

/// Outcome of a sync
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    /// Distinct tables with at least one successful fetch
    pub tables_synced: usize,
    pub fetches_completed: u64,
    pub fetches_failed: u64,
    pub rows_emitted: u64,
    /// Rows withheld because a required column was null or the item failed
    pub rows_rejected: u64,
    /// Items dropped because their detail lookup returned "not found"
    pub items_dropped: u64,
    pub table_errors: Vec<TableError>,
    pub row_errors: Vec<RowError>,
    pub duration: Duration,
}

impl SyncSummary {
    pub fn has_errors(&self) -> bool {
        !self.table_errors.is_empty() || !self.row_errors.is_empty()
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tables synced, {} rows emitted, {} rejected, {} dropped, {} table errors, {} row errors in {:.1}s",
            self.tables_synced,
            self.rows_emitted,
            self.rows_rejected,
            self.items_dropped,
            self.table_errors.len(),
            self.row_errors.len(),
            self.duration.as_secs_f64()
        )
    }
}

/// Thread-safe collector shared by all workers of a sync
#[derive(Debug, Default)]
pub(crate) struct Report {
    fetches_completed: AtomicU64,
    fetches_failed: AtomicU64,
    rows_emitted: AtomicU64,
    rows_rejected: AtomicU64,
    items_dropped: AtomicU64,
    synced_tables: Mutex<BTreeSet<String>>,
    table_errors: Mutex<Vec<TableError>>,
    row_errors: Mutex<Vec<RowError>>,
}

impl Report {
    pub fn fetch_completed(&self, table: &str) {
        self.fetches_completed.fetch_add(1, Ordering::Relaxed);
        self.synced_tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_string());
    }

    pub fn table_error(&self, error: TableError) {
        tracing::warn!(
            table = %error.table,
            partition = %error.partition,
            "table fetch failed: {}",
            error.error
        );
        self.fetches_failed.fetch_add(1, Ordering::Relaxed);
        self.table_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error);
    }

    pub fn row_error(&self, error: RowError) {
        tracing::warn!(
            table = %error.table,
            partition = %error.partition,
            column = error.column.as_deref().unwrap_or("-"),
            "row resolution failed: {}",
            error.error
        );
        self.row_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error);
    }

    pub fn row_emitted(&self) {
        self.rows_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn row_rejected(&self) {
        self.rows_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn item_dropped(&self) {
        self.items_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self, duration: Duration) -> SyncSummary {
        SyncSummary {
            tables_synced: self
                .synced_tables
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            fetches_completed: self.fetches_completed.load(Ordering::Relaxed),
            fetches_failed: self.fetches_failed.load(Ordering::Relaxed),
            rows_emitted: self.rows_emitted.load(Ordering::Relaxed),
            rows_rejected: self.rows_rejected.load(Ordering::Relaxed),
            items_dropped: self.items_dropped.load(Ordering::Relaxed),
            table_errors: self
                .table_errors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            row_errors: self
                .row_errors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            duration,
        }
    }
}

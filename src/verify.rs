//! Row-count reconciliation between the source and the written shards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use crate::error::ExportError;
use crate::types::ShardDescriptor;

/// Run-wide counters shared between the source wrapper and the pipeline.
#[derive(Debug, Clone, Default)]
pub struct RunCounters {
    /// Incremented once per document returned by the source.
    pub rows_read: Arc<AtomicU64>,
    /// Incremented once per row that made it through every transform stage.
    pub rows_transformed: Arc<AtomicU64>,
}

impl RunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read.load(Ordering::SeqCst)
    }

    pub fn rows_transformed(&self) -> u64 {
        self.rows_transformed.load(Ordering::SeqCst)
    }
}

/// Checks that every row read was transformed, queued, and written to exactly
/// one shard.
///
/// Runs once, after every shard worker and upload has terminated.
/// `rows_queued` is the number of rows the fan-out producer handed to the
/// shard queue.
///
/// # Returns
///
/// The total number of rows written, or `ExportError::Consistency` if the
/// four counts disagree.
pub fn verify_row_counts(
    counters: &RunCounters,
    rows_queued: u64,
    shards: &[ShardDescriptor],
) -> Result<u64, ExportError> {
    let rows_read = counters.rows_read();
    let rows_transformed = counters.rows_transformed();
    let rows_written: u64 = shards.iter().map(|s| s.row_count).sum();

    if [rows_read, rows_transformed, rows_queued]
        .iter()
        .any(|&count| count != rows_written)
    {
        error!(
            "❌ Row count mismatch: read={}, transformed={}, queued={}, written={}",
            rows_read, rows_transformed, rows_queued, rows_written
        );
        return Err(ExportError::Consistency {
            rows_read,
            rows_transformed,
            rows_queued,
            rows_written,
        });
    }

    info!(
        "Output {} total rows in {} files",
        rows_written,
        shards.len()
    );
    Ok(rows_written)
}

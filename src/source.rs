//! Row sources feeding the export.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, info};

use crate::error::ExportError;
use crate::types::Row;

/// A lazy, single-reader sequence of source documents.
#[async_trait]
pub trait RowSource: Send {
    /// Returns the next document, or `None` once the sequence is exhausted.
    async fn next_row(&mut self) -> Result<Option<Row>, ExportError>;
}

#[async_trait]
impl RowSource for Box<dyn RowSource> {
    async fn next_row(&mut self) -> Result<Option<Row>, ExportError> {
        (**self).next_row().await
    }
}

/// Wraps a source with the run's global "rows read" counter.
pub struct CountingSource<S> {
    inner: S,
    rows_read: Arc<AtomicU64>,
    progress_interval: u64,
}

impl<S: RowSource> CountingSource<S> {
    pub fn new(inner: S, rows_read: Arc<AtomicU64>, progress_interval: u64) -> Self {
        Self {
            inner,
            rows_read,
            progress_interval: progress_interval.max(1),
        }
    }
}

#[async_trait]
impl<S: RowSource> RowSource for CountingSource<S> {
    async fn next_row(&mut self) -> Result<Option<Row>, ExportError> {
        let row = self.inner.next_row().await?;
        if row.is_some() {
            let read = self.rows_read.fetch_add(1, Ordering::SeqCst) + 1;
            if read % self.progress_interval == 0 {
                info!("Processing source row: {}", read);
            }
        }
        Ok(row)
    }
}

/// In-memory source, for tests and small fixed inputs.
pub struct VecSource {
    rows: std::vec::IntoIter<Row>,
}

impl VecSource {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

#[async_trait]
impl RowSource for VecSource {
    async fn next_row(&mut self) -> Result<Option<Row>, ExportError> {
        Ok(self.rows.next())
    }
}

/// Reads one JSON document per line from a local file.
///
/// Blank lines are skipped; any other line must be a JSON object.
pub struct JsonLinesSource {
    lines: Lines<BufReader<tokio::fs::File>>,
    path: String,
    line_number: u64,
}

impl JsonLinesSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ExportError> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        debug!("Reading documents from {}", path.display());
        Ok(Self {
            lines: BufReader::with_capacity(1024 * 1024, file).lines(),
            path: path.display().to_string(),
            line_number: 0,
        })
    }
}

#[async_trait]
impl RowSource for JsonLinesSource {
    async fn next_row(&mut self) -> Result<Option<Row>, ExportError> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_number += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return match serde_json::from_str(line) {
                Ok(serde_json::Value::Object(row)) => Ok(Some(row)),
                Ok(_) => Err(ExportError::Source(format!(
                    "{}:{}: expected a JSON object",
                    self.path, self.line_number
                ))),
                Err(e) => Err(ExportError::Source(format!(
                    "{}:{}: {}",
                    self.path, self.line_number, e
                ))),
            };
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn counting_source_counts_only_rows() {
        let counter = Arc::new(AtomicU64::new(0));
        let rows = vec![row(json!({"a": 1})), row(json!({"a": 2}))];
        let mut source = CountingSource::new(VecSource::new(rows), counter.clone(), 1);

        while source.next_row().await.unwrap().is_some() {}
        assert!(source.next_row().await.unwrap().is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn json_lines_source_reads_objects_and_skips_blanks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"a\": {{\"b\": 1}}}}").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{{\"a\": 2}}").unwrap();

        let mut source = JsonLinesSource::open(file.path()).await.unwrap();
        assert_eq!(source.next_row().await.unwrap(), Some(row(json!({"a": {"b": 1}}))));
        assert_eq!(source.next_row().await.unwrap(), Some(row(json!({"a": 2}))));
        assert_eq!(source.next_row().await.unwrap(), None);
    }

    #[tokio::test]
    async fn json_lines_source_rejects_non_objects() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[1, 2]").unwrap();

        let mut source = JsonLinesSource::open(file.path()).await.unwrap();
        let err = source.next_row().await.unwrap_err();
        assert!(matches!(err, ExportError::Source(ref msg) if msg.ends_with(":1: expected a JSON object")));
    }
}

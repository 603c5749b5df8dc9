//! Data structures for export operations.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ExportError;

/// One exported record: field path to scalar or pre-serialized JSON value.
///
/// Source documents use the same type before flattening, in which case values
/// may still be nested objects and arrays.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Column name stamped with the run timestamp when the table config omits one.
pub const DEFAULT_DATE_COLUMN: &str = "_data_timestamp";

/// Mapping of one source field to a destination column.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Dot-separated path of the field in the flattened source row.
    #[serde(rename = "source")]
    pub source_path: String,
    /// Destination column. Empty means the field is dropped after remapping.
    #[serde(rename = "dest", default)]
    pub dest_path: String,
    /// Sensitive fields are exported as a boolean "has a value" flag.
    #[serde(rename = "pii", default)]
    pub is_sensitive: bool,
}

/// How Flatten names the fields of objects nested inside arrays.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArrayKeyStyle {
    /// `tags.0.name`, `tags.1.name`: every element keeps its own keys.
    #[default]
    Indexed,
    /// `tags.name` for every element; later elements overwrite earlier ones.
    Shared,
}

/// Per-table export settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    /// Database holding the collection. Falls back to the connection URL's database.
    #[serde(default)]
    pub database: Option<String>,
    /// Column that receives the run timestamp.
    #[serde(rename = "datadatecolumn", default = "default_date_column")]
    pub date_column: String,
    /// Only fetch the configured source fields from the database.
    ///
    /// Note: reused paths (e.g. `data.name` and `data.name.first`) make the
    /// parent incomplete when projected, so this is opt-in per table.
    #[serde(rename = "projection_optimization", default)]
    pub use_projection: bool,
    #[serde(default)]
    pub array_keys: ArrayKeyStyle,
}

fn default_date_column() -> String {
    DEFAULT_DATE_COLUMN.to_string()
}

impl Default for TableMetadata {
    fn default() -> Self {
        Self {
            database: None,
            date_column: default_date_column(),
            use_projection: false,
            array_keys: ArrayKeyStyle::default(),
        }
    }
}

/// A fully resolved table definition, loaded once per run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    /// Collection read from the source database.
    #[serde(rename = "source")]
    pub source_collection: String,
    /// Destination table name, used in object keys and the completion payload.
    #[serde(rename = "dest")]
    pub dest_name: String,
    #[serde(rename = "columns", default)]
    pub fields: Vec<FieldSpec>,
    #[serde(rename = "meta", default)]
    pub metadata: TableMetadata,
}

impl TableSpec {
    /// Source paths to request from the database, or `None` for whole documents.
    pub fn projection_paths(&self) -> Option<Vec<&str>> {
        if !self.metadata.use_projection {
            return None;
        }
        let mut paths: Vec<&str> = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            if !paths.contains(&field.source_path.as_str()) {
                paths.push(&field.source_path);
            }
        }
        Some(paths)
    }

    /// Checks the invariants the transform pipeline relies on.
    pub fn validate(&self) -> Result<(), ExportError> {
        if self.source_collection.is_empty() {
            return Err(ExportError::Config("table has no source collection".into()));
        }
        if self.dest_name.is_empty() {
            return Err(ExportError::Config(format!(
                "table '{}' has no destination name",
                self.source_collection
            )));
        }
        if self.metadata.date_column.is_empty() {
            return Err(ExportError::Config(format!(
                "table '{}' has an empty date column",
                self.source_collection
            )));
        }
        if let Some(field) = self.fields.iter().find(|f| f.source_path.is_empty()) {
            return Err(ExportError::Config(format!(
                "table '{}' maps an empty source path to '{}'",
                self.source_collection, field.dest_path
            )));
        }
        Ok(())
    }
}

/// Lifecycle of a single output shard.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    /// Path assigned, nothing written yet.
    Pending,
    /// Compressed stream closed; upload outcome unknown.
    Closed,
    /// Upload returned success and the integrity check passed.
    Uploaded,
    /// Encoding or upload failed. Never listed in a manifest.
    Failed,
}

/// One parallel partition of the output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub index: usize,
    /// Object key, fixed before any byte is written.
    pub output_path: String,
    pub row_count: u64,
    /// Compressed bytes handed to the uploader.
    pub bytes: u64,
    /// Hex MD5 of the compressed bytes.
    pub md5: Option<String>,
    pub status: ShardStatus,
}

impl ShardDescriptor {
    pub fn new(index: usize, output_path: String) -> Self {
        Self {
            index,
            output_path,
            row_count: 0,
            bytes: 0,
            md5: None,
            status: ShardStatus::Pending,
        }
    }
}

/// Configuration for an export run.
///
/// # Example
///
/// ```
/// use mongo_s3_export::ExportConfig;
///
/// let config = ExportConfig {
///     bucket: "analytics".to_string(),
///     num_shards: 8,
///     ..ExportConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Destination bucket name.
    pub bucket: String,
    /// Leading key component for every object (default: `"mongo"`). May be empty.
    pub key_prefix: String,
    /// Number of shards written and uploaded concurrently (default: 1).
    pub num_shards: usize,
    /// Transformed rows buffered between the source and the shard workers.
    pub row_queue_capacity: usize,
    /// Compressed chunks buffered between a shard's encoder and its uploader.
    ///
    /// This bound is the only backpressure between compression and upload:
    /// an encoder blocks once its uploader falls this many chunks behind.
    pub stream_buffer_chunks: usize,
    /// Encoded row bytes batched before each compression step; every
    /// non-empty compressed batch becomes one chunk for the uploader.
    pub chunk_size: usize,
    /// Gzip level, 0-9 (default: 1, fastest).
    pub compression_level: u32,
    /// Log a progress line every this many source rows.
    pub progress_interval: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            key_prefix: "mongo".to_string(),
            num_shards: 1,
            row_queue_capacity: 1024,
            stream_buffer_chunks: 4,
            chunk_size: 256 * 1024,
            compression_level: 1,
            progress_interval: 1_000_000,
        }
    }
}

impl ExportConfig {
    /// Rejects settings that would make the run impossible, before anything starts.
    pub fn validate(&self) -> Result<(), ExportError> {
        if self.bucket.is_empty() {
            return Err(ExportError::Config("a destination bucket is required".into()));
        }
        if self.num_shards < 1 {
            return Err(ExportError::Config(
                "must specify a number of output file parts >= 1".into(),
            ));
        }
        if self.row_queue_capacity == 0 || self.stream_buffer_chunks == 0 || self.chunk_size == 0 {
            return Err(ExportError::Config(
                "queue capacity, stream buffer and chunk size must all be non-zero".into(),
            ));
        }
        if self.compression_level > 9 {
            return Err(ExportError::Config(format!(
                "invalid compression level: {}",
                self.compression_level
            )));
        }
        if self.progress_interval == 0 {
            return Err(ExportError::Config("progress interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Completion report handed to the downstream load step on success.
#[derive(Serialize, Debug, Clone)]
pub struct ExportSummary {
    #[serde(rename = "tables")]
    pub destination: String,
    #[serde(rename = "config", skip_serializing_if = "Option::is_none")]
    pub config_url: Option<String>,
    #[serde(rename = "date")]
    pub timestamp: String,
    pub rows: u64,
    pub shards: usize,
    #[serde(rename = "manifest")]
    pub manifest_url: String,
    #[serde(skip)]
    pub elapsed: Duration,
}

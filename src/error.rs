//! Error types for export operations.

use std::io;
use thiserror::Error;

/// Errors that can occur during an export run.
///
/// Every variant is terminal for the run; there is no per-row skip and no
/// built-in retry.
#[derive(Error, Debug)]
pub enum ExportError {
    /// A transform stage rejected a row.
    #[error("Transform stage '{stage}' failed: {reason}")]
    Transform { stage: &'static str, reason: String },

    /// Encoding or compressing rows for a shard failed.
    #[error("Encoding shard {shard} failed: {reason}")]
    Encode { shard: usize, reason: String },

    /// The uploader went away before the shard was fully written.
    #[error("Upload stream for shard {shard} closed before all rows were written")]
    StreamClosed { shard: usize },

    /// Persisting an object to storage failed.
    #[error("Upload to {path} failed: {reason}")]
    Upload {
        shard: Option<usize>,
        path: String,
        reason: String,
    },

    /// Rows read from the source do not add up to rows written across shards.
    #[error(
        "Number of rows written: {rows_written} does not match the number of rows read: {rows_read} (transformed: {rows_transformed}, queued: {rows_queued})"
    )]
    Consistency {
        rows_read: u64,
        rows_transformed: u64,
        rows_queued: u64,
        rows_written: u64,
    },

    /// Building or publishing the manifest failed.
    #[error("Manifest {path} failed: {reason}")]
    Manifest { path: String, reason: String },

    /// Reading from the row source failed.
    #[error("Source read failed: {0}")]
    Source(String),

    /// MongoDB driver error.
    #[error(transparent)]
    MongoError(#[from] mongodb::error::Error),

    /// Invalid configuration, detected before the run starts.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// TOML config file could not be parsed.
    #[error(transparent)]
    TomlError(#[from] toml::de::Error),

    /// I/O error during file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    /// A spawned task panicked.
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// A task stopped because a peer task failed first.
    #[error("Stopped after a peer task failed: {0}")]
    Cancelled(String),
}

impl ExportError {
    /// Short name of the stage that failed, for the user-facing report.
    pub fn stage(&self) -> &'static str {
        match self {
            ExportError::Transform { .. } => "transform",
            ExportError::Encode { .. } | ExportError::StreamClosed { .. } => "encode",
            ExportError::Upload { .. } => "upload",
            ExportError::Consistency { .. } => "verify",
            ExportError::Manifest { .. } => "manifest",
            ExportError::Source(_) | ExportError::MongoError(_) => "source",
            ExportError::Config(_) | ExportError::TomlError(_) => "config",
            ExportError::IoError(_) | ExportError::SerdeJsonError(_) => "io",
            ExportError::TaskFailed(_) | ExportError::Cancelled(_) => "fanout",
        }
    }

    /// Errors that only ever follow another task's failure.
    ///
    /// The fan-out reports the root cause in preference to these.
    pub(crate) fn is_secondary(&self) -> bool {
        matches!(
            self,
            ExportError::StreamClosed { .. } | ExportError::Cancelled(_)
        )
    }

    /// Attributes an uploader error to the shard whose object it was writing.
    pub(crate) fn into_upload(self, shard: Option<usize>, path: &str) -> ExportError {
        match self {
            ExportError::Upload { path, reason, .. } => ExportError::Upload {
                shard,
                path,
                reason,
            },
            other => ExportError::Upload {
                shard,
                path: path.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

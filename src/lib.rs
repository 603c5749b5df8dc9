//! mongo-s3-export - Streaming, sharded export of MongoDB collections to object storage
//!
//! This library reads every document of a collection, flattens and remaps it
//! into a flat row, and writes the rows into N gzip-compressed JSON-lines
//! shards that are compressed and uploaded concurrently. Once every shard is
//! stored and the row counts reconcile, a manifest listing the shards is
//! published for a downstream bulk loader.
//!
//! # Features
//!
//! - **Streaming**: Rows flow through bounded queues; no shard is ever held in memory
//! - **Exactly-Once Fan-Out**: Every row lands in exactly one shard
//! - **Backpressure**: Compression waits for a lagging upload instead of buffering
//! - **Integrity Checks**: Row counts reconciled, uploaded bytes checked against MD5/ETag
//! - **All-or-Nothing Manifest**: Published only after every shard succeeded
//!
//! # Example
//!
//! ```no_run
//! use mongo_s3_export::{
//!     run_export, ConfigFile, ExportConfig, MongoRowSource, ObjectStoreUploader, S3Config,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (file, snapshot) = ConfigFile::load(Path::new("school.toml"))?;
//! let table = file.table_for_source("students")?;
//! let source = MongoRowSource::open(&file.url, None, None, table, 1000).await?;
//!
//! let config = ExportConfig {
//!     bucket: "analytics".to_string(),
//!     num_shards: 4,
//!     ..ExportConfig::default()
//! };
//! let uploader = Arc::new(ObjectStoreUploader::s3(&S3Config {
//!     bucket: config.bucket.clone(),
//!     ..S3Config::default()
//! })?);
//!
//! run_export(&config, table, "2024-01-01T00:00:00Z", source, uploader, Some(&snapshot)).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod fanout;
pub mod layout;
pub mod manifest;
pub mod mongo;
pub mod orchestrator;
pub mod sink;
pub mod source;
pub mod transform;
pub mod types;
pub mod upload;
pub mod verify;

pub use config::{ConfigFile, ConfigSnapshot};
pub use error::ExportError;
pub use layout::{run_timestamp, RunLayout};
pub use manifest::{Manifest, ManifestEntry};
pub use mongo::MongoRowSource;
pub use orchestrator::run_export;
pub use source::{JsonLinesSource, RowSource, VecSource};
pub use types::{
    ArrayKeyStyle, ExportConfig, ExportSummary, FieldSpec, Row, ShardDescriptor, ShardStatus,
    TableMetadata, TableSpec,
};
pub use upload::{
    DiscardUploader, LocalUploader, MemoryUploader, ObjectStoreUploader, S3Config, Uploader,
};

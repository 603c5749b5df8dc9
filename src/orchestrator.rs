//! Top-level run function tying the export stages together.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::config::ConfigSnapshot;
use crate::error::ExportError;
use crate::fanout::ShardFanout;
use crate::layout::RunLayout;
use crate::manifest::Manifest;
use crate::source::{CountingSource, RowSource};
use crate::transform::TransformPipeline;
use crate::types::{ExportConfig, ExportSummary, TableSpec};
use crate::upload::Uploader;
use crate::verify::{verify_row_counts, RunCounters};

/// Exports every row of `source` for `table` and publishes the manifest.
///
/// This is the main entry point. It performs the following steps:
///
/// 1. Validates the configuration and fixes the run's object layout
/// 2. Uploads a copy of the table config, if one is given
/// 3. Streams the source through the transform pipeline into
///    `config.num_shards` concurrently compressed and uploaded shards
/// 4. Reconciles rows read against rows written
/// 5. Publishes the manifest listing every shard
///
/// Any failure stops the run. Shard objects already accepted by storage are
/// left in place; without a manifest no downstream loader sees them.
///
/// # Arguments
///
/// * `config` - Export configuration
/// * `table` - Resolved table definition
/// * `timestamp` - Run timestamp (RFC 3339), stamped into rows and object keys
/// * `source` - Source documents, read exactly once
/// * `uploader` - Storage backend for shards, manifest and config copy
/// * `snapshot` - Raw config text to store next to the data
///
/// # Example
///
/// ```no_run
/// use mongo_s3_export::{run_export, ExportConfig, MemoryUploader, TableSpec, VecSource};
/// use std::sync::Arc;
///
/// # async fn example(table: TableSpec) -> Result<(), Box<dyn std::error::Error>> {
/// let config = ExportConfig {
///     bucket: "analytics".to_string(),
///     num_shards: 4,
///     ..ExportConfig::default()
/// };
/// let summary = run_export(
///     &config,
///     &table,
///     "2024-01-01T00:00:00Z",
///     VecSource::new(vec![]),
///     Arc::new(MemoryUploader::new()),
///     None,
/// )
/// .await?;
/// println!("{}", serde_json::to_string(&summary)?);
/// # Ok(())
/// # }
/// ```
pub async fn run_export<S: RowSource + 'static>(
    config: &ExportConfig,
    table: &TableSpec,
    timestamp: &str,
    source: S,
    uploader: Arc<dyn Uploader>,
    snapshot: Option<&ConfigSnapshot>,
) -> Result<ExportSummary, ExportError> {
    let started = Instant::now();
    config.validate()?;
    table.validate()?;
    let layout = RunLayout::new(&config.key_prefix, &table.dest_name, timestamp)?;

    info!(
        "Exporting {} -> {} ({} files, timestamp {})",
        table.source_collection, table.dest_name, config.num_shards, timestamp
    );

    let config_url = match snapshot {
        Some(snapshot) => Some(
            snapshot
                .publish(&config.bucket, &layout, uploader.as_ref())
                .await?,
        ),
        None => None,
    };

    let counters = RunCounters::new();
    let pipeline =
        TransformPipeline::for_table(table, timestamp, Arc::clone(&counters.rows_transformed));
    let source = CountingSource::new(
        source,
        Arc::clone(&counters.rows_read),
        config.progress_interval,
    );

    let progress = row_progress(&table.dest_name);
    let report = ShardFanout::new(
        config.clone(),
        layout.clone(),
        pipeline,
        Arc::clone(&uploader),
        progress,
    )
    .run(source)
    .await?;

    let rows = verify_row_counts(&counters, report.rows_produced, &report.shards)?;

    let manifest_url = Manifest::from_shards(&config.bucket, &report.shards)?
        .publish(&config.bucket, &layout, uploader.as_ref())
        .await?;

    let elapsed = started.elapsed();
    info!(
        "✅ Exported {} rows of {} in {} files ({})",
        rows,
        table.dest_name,
        report.shards.len(),
        humantime::format_duration(Duration::from_secs(elapsed.as_secs()))
    );

    Ok(ExportSummary {
        destination: table.dest_name.clone(),
        config_url,
        timestamp: timestamp.to_string(),
        rows,
        shards: report.shards.len(),
        manifest_url,
        elapsed,
    })
}

/// Spinner counting exported rows; hidden when stderr is not a terminal.
fn row_progress(dest: &str) -> ProgressBar {
    if !atty::is(atty::Stream::Stderr) {
        return ProgressBar::hidden();
    }
    let progress = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg} {pos} rows | {elapsed_precise} elapsed, {per_sec}")
    {
        progress.set_style(style);
    }
    progress.set_message(format!("📦 Exporting {}", dest));
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

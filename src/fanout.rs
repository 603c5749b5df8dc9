//! Concurrent fan-out of one transformed row stream into N shards.
//!
//! Task layout for `N` shards:
//!
//! - one producer: reads the source, runs the transform pipeline, and feeds
//!   a bounded row queue
//! - `N` shard workers: each claims rows from the queue and writes them into
//!   its own [`ShardSink`]
//! - `N` upload tasks: each drains one shard's compressed stream into the
//!   [`Uploader`]
//!
//! All `2N + 1` tasks live in one `JoinSet`. The first root-cause failure
//! aborts the rest, and [`ShardFanout::run`] only returns once every task has
//! terminated.

use indicatif::ProgressBar;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::ExportError;
use crate::layout::RunLayout;
use crate::sink::{shard_channel, ByteStream, ShardSink, SinkStats};
use crate::source::RowSource;
use crate::transform::TransformPipeline;
use crate::types::{ExportConfig, Row, ShardDescriptor, ShardStatus};
use crate::upload::{verify_receipt, UploadReceipt, Uploader};

/// The single claim point shared by every shard worker.
///
/// Whoever holds the lock receives the next row, so each row reaches exactly
/// one shard.
type RowQueue = Arc<Mutex<mpsc::Receiver<Row>>>;

/// Set once any task fails. Checked by workers before every claim, so a
/// worker never closes its shard cleanly after a peer has failed.
type FailureFlag = Arc<AtomicBool>;

/// What a finished task hands back to the barrier.
enum TaskOutcome {
    Produced(u64),
    Written { index: usize, stats: SinkStats },
    Uploaded { index: usize, receipt: UploadReceipt },
}

/// Result of a completed fan-out.
#[derive(Debug)]
pub struct FanoutReport {
    /// Descriptors in shard-index order.
    pub shards: Vec<ShardDescriptor>,
    /// Rows the producer handed to the queue.
    pub rows_produced: u64,
}

/// Spawns and joins the producer, shard workers and upload tasks of one run.
pub struct ShardFanout {
    config: ExportConfig,
    layout: RunLayout,
    pipeline: Arc<TransformPipeline>,
    uploader: Arc<dyn Uploader>,
    progress: ProgressBar,
}

impl ShardFanout {
    pub fn new(
        config: ExportConfig,
        layout: RunLayout,
        pipeline: TransformPipeline,
        uploader: Arc<dyn Uploader>,
        progress: ProgressBar,
    ) -> Self {
        Self {
            config,
            layout,
            pipeline: Arc::new(pipeline),
            uploader,
            progress,
        }
    }

    /// Exports every row of `source` across `config.num_shards` shards.
    ///
    /// # Returns
    ///
    /// Descriptors of all shards, each uploaded and integrity-checked, or the
    /// error that stopped the run.
    pub async fn run<S: RowSource + 'static>(self, source: S) -> Result<FanoutReport, ExportError> {
        self.config.validate()?;

        let mut shards: Vec<ShardDescriptor> = (0..self.config.num_shards)
            .map(|index| ShardDescriptor::new(index, self.layout.shard_key(index)))
            .collect();

        let (row_tx, row_rx) = mpsc::channel(self.config.row_queue_capacity);
        let queue: RowQueue = Arc::new(Mutex::new(row_rx));
        let failed: FailureFlag = Arc::default();
        let mut tasks: JoinSet<Result<TaskOutcome, ExportError>> = JoinSet::new();

        tasks.spawn(produce(
            source,
            Arc::clone(&self.pipeline),
            row_tx,
            Arc::clone(&failed),
        ));

        for shard in &shards {
            info!(
                "Outputting file number: {} to location: {}",
                shard.index, shard.output_path
            );
            let (sink, stream) = shard_channel(shard.index, &self.config);
            tasks.spawn(drain_queue(
                Arc::clone(&queue),
                sink,
                Arc::clone(&failed),
                self.progress.clone(),
            ));
            tasks.spawn(upload_shard(
                shard.index,
                shard.output_path.clone(),
                stream,
                Arc::clone(&self.uploader),
            ));
        }
        // Only the workers hold the queue now; the producer sees a closed
        // channel once the last of them is gone.
        drop(queue);

        let mut written: Vec<Option<SinkStats>> = vec![None; shards.len()];
        let mut receipts: Vec<Option<UploadReceipt>> = vec![None; shards.len()];
        let mut rows_produced = 0;
        let mut failure: Option<ExportError> = None;

        // Barrier: drain every task, including the ones aborted below.
        while let Some(joined) = tasks.join_next().await {
            let err = match joined {
                Ok(Ok(TaskOutcome::Produced(rows))) => {
                    debug!("Source exhausted after {} rows", rows);
                    rows_produced = rows;
                    continue;
                }
                Ok(Ok(TaskOutcome::Written { index, stats })) => {
                    info!(
                        "Output destination collection: {}, count: {}, fileIndex: {}",
                        self.layout.dest(),
                        stats.rows,
                        index
                    );
                    shards[index].status = ShardStatus::Closed;
                    written[index] = Some(stats);
                    continue;
                }
                Ok(Ok(TaskOutcome::Uploaded { index, receipt })) => {
                    debug!("Shard {} upload returned ({} bytes)", index, receipt.bytes);
                    receipts[index] = Some(receipt);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => ExportError::TaskFailed(format!("Task join error: {}", e)),
            };

            if err.is_secondary() {
                debug!("Task stopped after a peer failed: {}", err);
                failure.get_or_insert(err);
            } else if failure.as_ref().map_or(true, ExportError::is_secondary) {
                error!("❌ Export task failed: {}", err);
                failed.store(true, Ordering::SeqCst);
                tasks.abort_all();
                failure = Some(err);
            } else {
                debug!("Further failure after abort: {}", err);
            }
        }

        self.progress.finish_and_clear();

        for shard in shards.iter_mut() {
            let index = shard.index;
            match (written[index].take(), receipts[index].take()) {
                (Some(stats), Some(receipt)) => {
                    shard.row_count = stats.rows;
                    shard.bytes = stats.bytes;
                    if let Err(reason) = verify_receipt(&receipt, stats.bytes, &stats.md5) {
                        shard.status = ShardStatus::Failed;
                        if failure.as_ref().map_or(true, ExportError::is_secondary) {
                            failure = Some(ExportError::Upload {
                                shard: Some(index),
                                path: shard.output_path.clone(),
                                reason,
                            });
                        }
                    } else {
                        shard.status = ShardStatus::Uploaded;
                    }
                    shard.md5 = Some(stats.md5);
                }
                _ => shard.status = ShardStatus::Failed,
            }
        }

        if let Some(err) = failure {
            for shard in shards.iter().filter(|s| s.status != ShardStatus::Uploaded) {
                warn!(
                    "Shard {} ({}) not uploaded; excluded from the manifest",
                    shard.index, shard.output_path
                );
            }
            return Err(err);
        }

        Ok(FanoutReport {
            shards,
            rows_produced,
        })
    }
}

/// Reads and transforms every source row into the shared queue.
///
/// On failure the flag is raised before the queue closes, so workers treat
/// the closed queue as an abort rather than the end of the data.
async fn produce<S: RowSource>(
    source: S,
    pipeline: Arc<TransformPipeline>,
    rows: mpsc::Sender<Row>,
    failed: FailureFlag,
) -> Result<TaskOutcome, ExportError> {
    let result = feed_queue(source, &pipeline, &rows).await;
    if result.is_err() {
        failed.store(true, Ordering::SeqCst);
    }
    result.map(TaskOutcome::Produced)
}

async fn feed_queue<S: RowSource>(
    mut source: S,
    pipeline: &TransformPipeline,
    rows: &mpsc::Sender<Row>,
) -> Result<u64, ExportError> {
    let mut produced = 0u64;
    while let Some(row) = source.next_row().await? {
        let row = pipeline.apply(row)?;
        if rows.send(row).await.is_err() {
            return Err(ExportError::Cancelled(
                "all shard workers stopped before the source was exhausted".into(),
            ));
        }
        produced += 1;
    }
    Ok(produced)
}

/// Claims rows until the queue is closed and empty, then closes the shard.
async fn drain_queue(
    queue: RowQueue,
    mut sink: ShardSink,
    failed: FailureFlag,
    progress: ProgressBar,
) -> Result<TaskOutcome, ExportError> {
    let index = sink.index();
    loop {
        check_peers(&failed, &sink)?;
        let claimed = queue.lock().await.recv().await;
        let Some(row) = claimed else { break };
        sink.write_row(&row).await?;
        progress.inc(1);
    }
    // The queue also closes when the producer fails.
    check_peers(&failed, &sink)?;
    let stats = sink.close().await?;
    Ok(TaskOutcome::Written { index, stats })
}

/// Dropping the sink on this error fails the paired upload.
fn check_peers(failed: &FailureFlag, sink: &ShardSink) -> Result<(), ExportError> {
    if failed.load(Ordering::SeqCst) {
        return Err(ExportError::Cancelled(format!(
            "shard {} stopped after {} rows",
            sink.index(),
            sink.rows()
        )));
    }
    Ok(())
}

async fn upload_shard(
    index: usize,
    path: String,
    stream: ByteStream,
    uploader: Arc<dyn Uploader>,
) -> Result<TaskOutcome, ExportError> {
    let receipt = uploader
        .upload(&path, stream)
        .await
        .map_err(|e| e.into_upload(Some(index), &path))?;
    Ok(TaskOutcome::Uploaded { index, receipt })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::VecSource;
    use crate::types::{FieldSpec, TableMetadata, TableSpec};
    use crate::upload::MemoryUploader;
    use flate2::read::GzDecoder;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::io::Read;
    use std::sync::atomic::AtomicU64;

    fn table() -> TableSpec {
        TableSpec {
            source_collection: "things".to_string(),
            dest_name: "things".to_string(),
            fields: vec![FieldSpec {
                source_path: "id".to_string(),
                dest_path: "id".to_string(),
                is_sensitive: false,
            }],
            metadata: TableMetadata::default(),
        }
    }

    fn small_config(num_shards: usize) -> ExportConfig {
        ExportConfig {
            bucket: "bucket".to_string(),
            num_shards,
            row_queue_capacity: 2,
            stream_buffer_chunks: 1,
            chunk_size: 128,
            ..ExportConfig::default()
        }
    }

    fn fanout(num_shards: usize, uploader: Arc<dyn Uploader>) -> (ShardFanout, Arc<AtomicU64>) {
        fanout_with(small_config(num_shards), uploader)
    }

    fn fanout_with(
        config: ExportConfig,
        uploader: Arc<dyn Uploader>,
    ) -> (ShardFanout, Arc<AtomicU64>) {
        let counter = Arc::new(AtomicU64::new(0));
        let layout = RunLayout::new("mongo", "things", "2024-01-01T00:00:00Z").unwrap();
        let pipeline = TransformPipeline::for_table(&table(), layout.timestamp(), counter.clone());
        (
            ShardFanout::new(config, layout, pipeline, uploader, ProgressBar::hidden()),
            counter,
        )
    }

    fn rows(n: u64) -> VecSource {
        VecSource::new(
            (0..n)
                .map(|i| json!({"id": i, "noise": "z".repeat(40)}).as_object().cloned().unwrap())
                .collect(),
        )
    }

    fn ids_in(bytes: &[u8]) -> Vec<u64> {
        let mut text = String::new();
        GzDecoder::new(bytes).read_to_string(&mut text).unwrap();
        text.lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap()["id"].as_u64().unwrap())
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_row_lands_in_exactly_one_shard() {
        let uploader = MemoryUploader::new();
        let (fanout, transformed) = fanout(4, Arc::new(uploader.clone()));

        let report = fanout.run(rows(500)).await.unwrap();

        assert_eq!(report.rows_produced, 500);
        assert_eq!(transformed.load(Ordering::SeqCst), 500);
        assert_eq!(report.shards.iter().map(|s| s.row_count).sum::<u64>(), 500);

        let mut seen = BTreeSet::new();
        for shard in &report.shards {
            assert_eq!(shard.status, ShardStatus::Uploaded);
            let ids = ids_in(&uploader.get(&shard.output_path).unwrap());
            assert_eq!(ids.len() as u64, shard.row_count);
            for id in ids {
                assert!(seen.insert(id), "row {} claimed twice", id);
            }
        }
        assert_eq!(seen, (0..500).collect());
    }

    #[tokio::test]
    async fn more_shards_than_rows_leaves_empty_shards() {
        let uploader = MemoryUploader::new();
        let (fanout, _) = fanout(5, Arc::new(uploader.clone()));

        let report = fanout.run(rows(2)).await.unwrap();

        assert_eq!(report.shards.len(), 5);
        assert_eq!(report.shards.iter().map(|s| s.row_count).sum::<u64>(), 2);
        assert_eq!(uploader.objects().len(), 5);
    }

    #[tokio::test]
    async fn upload_failure_fails_the_run() {
        let uploader = MemoryUploader::failing_on("_1.json.gz");
        let (fanout, _) = fanout(3, Arc::new(uploader.clone()));

        let err = fanout.run(rows(300)).await.unwrap_err();

        assert!(
            matches!(err, ExportError::Upload { shard: Some(1), .. }),
            "unexpected error: {:?}",
            err
        );
        assert!(uploader.objects().keys().all(|k| !k.ends_with("_1.json.gz")));
    }

    #[tokio::test]
    async fn source_failure_stops_all_shards() {
        struct Broken(u64);

        #[async_trait::async_trait]
        impl RowSource for Broken {
            async fn next_row(&mut self) -> Result<Option<Row>, ExportError> {
                self.0 += 1;
                if self.0 > 50 {
                    return Err(ExportError::Source("cursor killed".into()));
                }
                Ok(json!({"id": self.0}).as_object().cloned())
            }
        }

        let uploader = MemoryUploader::new();
        let (fanout, _) = fanout(2, Arc::new(uploader.clone()));

        let err = fanout.run(Broken(0)).await.unwrap_err();
        assert!(matches!(err, ExportError::Source(_)), "unexpected error: {:?}", err);
    }

    #[tokio::test]
    async fn zero_shards_is_rejected() {
        let (fanout, _) = fanout(0, Arc::new(MemoryUploader::new()));
        assert!(matches!(fanout.run(rows(1)).await, Err(ExportError::Config(_))));
    }

    #[tokio::test]
    async fn zero_capacity_queues_are_rejected() {
        for config in [
            ExportConfig {
                row_queue_capacity: 0,
                ..small_config(2)
            },
            ExportConfig {
                stream_buffer_chunks: 0,
                ..small_config(2)
            },
            ExportConfig {
                chunk_size: 0,
                ..small_config(2)
            },
        ] {
            let uploader = MemoryUploader::new();
            let (fanout, _) = fanout_with(config, Arc::new(uploader.clone()));
            let err = fanout.run(VecSource::new(vec![])).await.unwrap_err();
            assert!(matches!(err, ExportError::Config(_)), "{:?}", err);
            assert!(uploader.objects().is_empty());
        }
    }
}

//! Shard sink: JSON-lines encoding, gzip compression and the bounded byte
//! stream that hands compressed output to an uploader.
//!
//! The writer side ([`ShardSink`]) and the reader side ([`ChunkStream`]) are
//! joined by a bounded channel. When the uploader falls behind, the channel
//! fills and [`ShardSink::write_row`] waits, so a shard never holds more than
//! `stream_buffer_chunks` chunks of compressed output in memory.
//!
//! Rows are encoded into a plain buffer on the async worker. Each full batch
//! is compressed on the blocking pool, so gzip never runs on a runtime thread.

use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::Stream;
use md5::{Digest, Md5};
use std::io::{self, Write};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::sync::mpsc;

use crate::error::ExportError;
use crate::types::{ExportConfig, Row};

/// Compressed bytes on their way to storage.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Vec<u8>>> + Send + Sync>>;

enum Frame {
    Chunk(Vec<u8>),
    /// Sent once the compressor has been finished and flushed.
    End,
}

/// Totals for a closed shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkStats {
    pub rows: u64,
    pub bytes: u64,
    /// Hex MD5 of every compressed byte sent.
    pub md5: String,
}

/// Writer side of one shard's compressed stream.
pub struct ShardSink {
    index: usize,
    /// Out only while a batch is being compressed.
    encoder: Option<GzEncoder<Vec<u8>>>,
    /// Encoded rows not yet compressed.
    pending: Vec<u8>,
    tx: mpsc::Sender<Frame>,
    chunk_size: usize,
    rows: u64,
    bytes: u64,
    hasher: Md5,
}

/// Creates the sink for shard `index` and the stream its uploader consumes.
///
/// `config` must have passed [`ExportConfig::validate`].
pub(crate) fn shard_channel(index: usize, config: &ExportConfig) -> (ShardSink, ByteStream) {
    let (tx, rx) = mpsc::channel(config.stream_buffer_chunks);
    let sink = ShardSink {
        index,
        encoder: Some(GzEncoder::new(
            Vec::new(),
            Compression::new(config.compression_level),
        )),
        pending: Vec::with_capacity(config.chunk_size),
        tx,
        chunk_size: config.chunk_size,
        rows: 0,
        bytes: 0,
        hasher: Md5::new(),
    };
    (sink, Box::pin(ChunkStream { rx, finished: false }))
}

impl ShardSink {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Encodes one row as a JSON line.
    ///
    /// Once `chunk_size` encoded bytes are pending they are compressed and
    /// sent, waiting for the uploader if the stream buffer is full.
    pub async fn write_row(&mut self, row: &Row) -> Result<(), ExportError> {
        serde_json::to_writer(&mut self.pending, row).map_err(|e| self.encode_error(e))?;
        self.pending.push(b'\n');
        self.rows += 1;

        if self.pending.len() >= self.chunk_size {
            self.compress_pending(false).await?;
        }
        Ok(())
    }

    /// Finishes the gzip stream, then closes the byte stream.
    ///
    /// The compressor must be finished before the stream ends, otherwise the
    /// uploaded object is missing its trailing block and checksum.
    pub async fn close(mut self) -> Result<SinkStats, ExportError> {
        self.compress_pending(true).await?;
        self.tx
            .send(Frame::End)
            .await
            .map_err(|_| ExportError::StreamClosed { shard: self.index })?;

        Ok(SinkStats {
            rows: self.rows,
            bytes: self.bytes,
            md5: format!("{:x}", self.hasher.finalize()),
        })
    }

    /// Compresses the pending rows on the blocking pool and sends whatever
    /// the compressor emitted. `finish` also writes the gzip trailer.
    async fn compress_pending(&mut self, finish: bool) -> Result<(), ExportError> {
        let mut encoder = self
            .encoder
            .take()
            .ok_or_else(|| self.encode_error("compressor lost after an earlier failure"))?;
        let mut input = std::mem::take(&mut self.pending);

        let (encoder, output, input) = tokio::task::spawn_blocking(move || {
            encoder.write_all(&input)?;
            if finish {
                encoder.try_finish()?;
            }
            let output = std::mem::take(encoder.get_mut());
            input.clear();
            Ok::<_, io::Error>((encoder, output, input))
        })
        .await
        .map_err(|e| self.encode_error(format!("compression task failed: {}", e)))?
        .map_err(|e| self.encode_error(e))?;

        self.encoder = Some(encoder);
        self.pending = input;
        self.send(output).await
    }

    async fn send(&mut self, chunk: Vec<u8>) -> Result<(), ExportError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.hasher.update(&chunk);
        self.bytes += chunk.len() as u64;
        self.tx
            .send(Frame::Chunk(chunk))
            .await
            .map_err(|_| ExportError::StreamClosed { shard: self.index })
    }

    fn encode_error(&self, e: impl std::fmt::Display) -> ExportError {
        ExportError::Encode {
            shard: self.index,
            reason: e.to_string(),
        }
    }
}

/// Reader side of a shard's compressed stream.
///
/// Ends cleanly only after the sink was closed. If the sink is dropped
/// first (its worker failed or was cancelled) the stream yields an
/// `UnexpectedEof` error, so a truncated shard can never upload as complete.
pub struct ChunkStream {
    rx: mpsc::Receiver<Frame>,
    finished: bool,
}

impl Stream for ChunkStream {
    type Item = io::Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match ready!(self.rx.poll_recv(cx)) {
            Some(Frame::Chunk(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Some(Frame::End) => {
                self.finished = true;
                Poll::Ready(None)
            }
            None => {
                self.finished = true;
                Poll::Ready(Some(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "shard stream ended before its compressor was closed",
                ))))
            }
        }
    }
}

/// Wraps an in-memory body (manifest, config copy) as a single-chunk stream.
pub fn single_chunk(body: Vec<u8>) -> ByteStream {
    Box::pin(futures_util::stream::once(futures_util::future::ready(Ok(body))))
}

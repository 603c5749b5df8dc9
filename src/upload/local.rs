//! Local filesystem backend.

use async_trait::async_trait;
use futures_util::StreamExt;
use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::info;

use super::{UploadReceipt, Uploader};
use crate::error::ExportError;
use crate::sink::ByteStream;

/// Writes objects to `<root>/<bucket>/<key>`, mirroring the bucket layout on disk.
#[derive(Debug, Clone)]
pub struct LocalUploader {
    base: PathBuf,
}

impl LocalUploader {
    pub fn new(root: impl AsRef<Path>, bucket: &str) -> Self {
        Self {
            base: root.as_ref().join(bucket),
        }
    }

    pub fn object_path(&self, key: &str) -> PathBuf {
        self.base.join(key)
    }
}

#[async_trait]
impl Uploader for LocalUploader {
    async fn upload(&self, key: &str, mut body: ByteStream) -> Result<UploadReceipt, ExportError> {
        let filename = self.object_path(key);
        info!("Writing file: {} to path: {}", key, filename.display());

        // Create parent directory if needed
        if let Some(parent) = filename.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = BufWriter::new(tokio::fs::File::create(&filename).await?);
        let mut hasher = Md5::new();
        let mut bytes = 0u64;

        while let Some(piece) = body.next().await {
            let chunk = piece.map_err(|e| ExportError::Upload {
                shard: None,
                path: key.to_string(),
                reason: e.to_string(),
            })?;
            hasher.update(&chunk);
            bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.into_inner().sync_all().await?;

        Ok(UploadReceipt {
            bytes,
            etag: Some(format!("{:x}", hasher.finalize())),
        })
    }
}

//! S3 (and any other `object_store` backend) uploads.

use async_trait::async_trait;
use futures_util::StreamExt;
use object_store::aws::{AmazonS3Builder, AmazonS3ConfigKey};
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload, PutResult, WriteMultipart};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{UploadReceipt, Uploader};
use crate::error::ExportError;
use crate::sink::ByteStream;

/// Smallest part S3 accepts for all but the last part of a multipart upload.
pub const DEFAULT_PART_SIZE: usize = 5 * 1024 * 1024;
/// Parts of one object in flight at once.
pub const DEFAULT_MAX_CONCURRENT_PARTS: usize = 4;

/// Where and how to reach the S3 bucket.
///
/// Credentials always come from the environment (`AWS_ACCESS_KEY_ID`,
/// `AWS_SECRET_ACCESS_KEY`, `AWS_SESSION_TOKEN`, instance metadata, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S3Config {
    pub bucket: String,
    /// Overrides `AWS_REGION` / `AWS_DEFAULT_REGION`.
    pub region: Option<String>,
    /// S3-compatible endpoint (MinIO, R2, ...), addressed path-style.
    pub endpoint: Option<String>,
}

/// `AmazonS3ConfigKey::Encryption(S3EncryptionConfigKey::ServerSideEncryption)`;
/// `object_store` does not export `S3EncryptionConfigKey`, so parse its name.
fn sse_config_key() -> AmazonS3ConfigKey {
    "aws_server_side_encryption"
        .parse()
        .expect("object_store recognizes aws_server_side_encryption")
}

impl S3Config {
    /// Builder for this bucket with AES256 server-side encryption on every write.
    pub fn builder(&self) -> AmazonS3Builder {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&self.bucket)
            .with_config(
                sse_config_key(),
                "AES256",
            );

        if let Some(region) = &self.region {
            builder = builder.with_region(region);
        }

        if let Some(endpoint) = &self.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false)
                .with_allow_http(true);
        }
        builder
    }
}

/// Streams objects into an [`ObjectStore`].
///
/// Bodies shorter than one part go up in a single PUT. Longer bodies are
/// uploaded as a multipart upload, part by part as the stream produces them,
/// so at most `part_size * (max_concurrent_parts + 1)` bytes are held at once.
/// A stream error aborts the multipart upload, so no partial object becomes
/// visible.
#[derive(Debug, Clone)]
pub struct ObjectStoreUploader {
    store: Arc<dyn ObjectStore>,
    part_size: usize,
    max_concurrent_parts: usize,
}

impl ObjectStoreUploader {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            part_size: DEFAULT_PART_SIZE,
            max_concurrent_parts: DEFAULT_MAX_CONCURRENT_PARTS,
        }
    }

    /// Connects to S3 as described by `config`.
    pub fn s3(config: &S3Config) -> Result<Self, ExportError> {
        let store = config
            .builder()
            .build()
            .map_err(|e| ExportError::Config(format!("invalid S3 configuration: {}", e)))?;
        info!(
            "Uploading to s3://{} ({})",
            config.bucket,
            config.endpoint.as_deref().unwrap_or("AWS")
        );
        Ok(Self::new(Arc::new(store)))
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    pub fn with_max_concurrent_parts(mut self, max_concurrent_parts: usize) -> Self {
        self.max_concurrent_parts = max_concurrent_parts.max(1);
        self
    }

    async fn put_multipart(
        &self,
        key: &str,
        path: &Path,
        head: Vec<u8>,
        mut body: ByteStream,
    ) -> Result<(PutResult, u64), ExportError> {
        let upload = self
            .store
            .put_multipart(path)
            .await
            .map_err(|e| upload_error(key, e))?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, self.part_size);
        let mut bytes = head.len() as u64;
        writer.write(&head);
        drop(head);

        while let Some(piece) = body.next().await {
            let failure = match piece {
                Ok(chunk) => match writer.wait_for_capacity(self.max_concurrent_parts).await {
                    Ok(()) => {
                        bytes += chunk.len() as u64;
                        writer.write(&chunk);
                        continue;
                    }
                    Err(e) => upload_error(key, e),
                },
                Err(e) => upload_error(key, e),
            };
            if let Err(e) = writer.abort().await {
                warn!("⚠️  Failed to abort multipart upload of {}: {}", key, e);
            }
            return Err(failure);
        }

        let result = writer.finish().await.map_err(|e| upload_error(key, e))?;
        Ok((result, bytes))
    }
}

#[async_trait]
impl Uploader for ObjectStoreUploader {
    async fn upload(&self, key: &str, mut body: ByteStream) -> Result<UploadReceipt, ExportError> {
        let path = Path::parse(key).map_err(|e| upload_error(key, e))?;
        info!("Uploading file: {}", key);

        let mut head = Vec::new();
        while head.len() < self.part_size {
            match body.next().await {
                Some(piece) => head.extend_from_slice(&piece.map_err(|e| upload_error(key, e))?),
                None => {
                    let bytes = head.len() as u64;
                    let result = self
                        .store
                        .put(&path, PutPayload::from(head))
                        .await
                        .map_err(|e| upload_error(key, e))?;
                    debug!("Stored {} in one request ({} bytes)", key, bytes);
                    return Ok(receipt(result.e_tag, bytes));
                }
            }
        }

        let (result, bytes) = self.put_multipart(key, &path, head, body).await?;
        debug!("Stored {} as multipart upload ({} bytes)", key, bytes);
        Ok(receipt(result.e_tag, bytes))
    }
}

fn receipt(etag: Option<String>, bytes: u64) -> UploadReceipt {
    UploadReceipt {
        bytes,
        etag: etag.map(|etag| etag.trim_matches('"').to_string()),
    }
}

fn upload_error(key: &str, e: impl std::fmt::Display) -> ExportError {
    ExportError::Upload {
        shard: None,
        path: key.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::single_chunk;
    use object_store::memory::InMemory;

    fn chunks(pieces: Vec<std::io::Result<Vec<u8>>>) -> ByteStream {
        Box::pin(futures_util::stream::iter(pieces))
    }

    async fn stored(store: &InMemory, key: &str) -> Option<Vec<u8>> {
        let result = store.get(&Path::parse(key).unwrap()).await.ok()?;
        Some(result.bytes().await.unwrap().to_vec())
    }

    #[test]
    fn s3_builder_requests_aes256_encryption() {
        let config = S3Config {
            bucket: "analytics".to_string(),
            region: Some("eu-west-1".to_string()),
            endpoint: Some("http://localhost:9000".to_string()),
        };
        let builder = config.builder();
        let get = |key: AmazonS3ConfigKey| builder.get_config_value(&key);

        assert_eq!(
            get(sse_config_key())
            .as_deref(),
            Some("AES256")
        );
        assert_eq!(get(AmazonS3ConfigKey::Bucket).as_deref(), Some("analytics"));
        assert_eq!(get(AmazonS3ConfigKey::Region).as_deref(), Some("eu-west-1"));
        assert_eq!(
            get(AmazonS3ConfigKey::Endpoint).as_deref(),
            Some("http://localhost:9000")
        );
    }

    #[tokio::test]
    async fn small_body_is_a_single_put() {
        let store = Arc::new(InMemory::new());
        let uploader = ObjectStoreUploader::new(store.clone());

        let receipt = uploader
            .upload("mongo/t/x.manifest", single_chunk(b"{\"entries\":[]}".to_vec()))
            .await
            .unwrap();

        assert_eq!(receipt.bytes, 14);
        assert!(receipt.etag.is_some());
        assert_eq!(
            stored(&store, "mongo/t/x.manifest").await.unwrap(),
            b"{\"entries\":[]}"
        );
    }

    #[tokio::test]
    async fn long_body_streams_as_multipart() {
        let store = Arc::new(InMemory::new());
        let uploader = ObjectStoreUploader::new(store.clone())
            .with_part_size(16)
            .with_max_concurrent_parts(2);

        let pieces: Vec<std::io::Result<Vec<u8>>> =
            (0..20u8).map(|i| Ok(vec![b'a' + i; 7])).collect();
        let expected: Vec<u8> = (0..20u8).flat_map(|i| vec![b'a' + i; 7]).collect();

        let receipt = uploader.upload("t/part_0.json.gz", chunks(pieces)).await.unwrap();

        assert_eq!(receipt.bytes, expected.len() as u64);
        assert_eq!(stored(&store, "t/part_0.json.gz").await.unwrap(), expected);
    }

    #[tokio::test]
    async fn stream_error_fails_without_storing_an_object() {
        let store = Arc::new(InMemory::new());
        let uploader = ObjectStoreUploader::new(store.clone()).with_part_size(4);

        for (key, pieces) in [
            ("t/short.json.gz", vec![Err(std::io::Error::other("encoder went away"))]),
            (
                "t/long.json.gz",
                vec![
                    Ok(b"0123456789".to_vec()),
                    Ok(b"abcdef".to_vec()),
                    Err(std::io::Error::other("encoder went away")),
                ],
            ),
        ] {
            let err = uploader.upload(key, chunks(pieces)).await.unwrap_err();
            assert!(
                matches!(err, ExportError::Upload { ref path, ref reason, .. }
                    if path == key && reason.contains("encoder went away")),
                "{:?}",
                err
            );
            assert!(stored(&store, key).await.is_none(), "{} was stored", key);
        }
    }

    #[tokio::test]
    async fn invalid_key_is_an_upload_error() {
        let uploader = ObjectStoreUploader::new(Arc::new(InMemory::new()));
        let err = uploader
            .upload("a//b", single_chunk(b"x".to_vec()))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "upload");
    }

    #[test]
    fn receipt_trims_quoted_etag() {
        let etag = Some("\"5d41402abc4b2a76b9719d911017c592\"".to_string());
        assert_eq!(
            receipt(etag, 5).etag.as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
    }
}

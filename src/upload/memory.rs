//! In-memory backend for tests.

use async_trait::async_trait;
use futures_util::StreamExt;
use md5::{Digest, Md5};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::{UploadReceipt, Uploader};
use crate::error::ExportError;
use crate::sink::ByteStream;

type ObjectMap = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

/// Keeps every stored object in memory, keyed by object key.
///
/// Optionally fails any upload whose key contains a given pattern, after the
/// first chunk has been consumed, to simulate a transfer dying part-way.
#[derive(Debug, Clone, Default)]
pub struct MemoryUploader {
    objects: ObjectMap,
    fail_pattern: Option<String>,
}

impl MemoryUploader {
    pub fn new() -> Self {
        Self::default()
    }

    /// An uploader that fails uploads of keys containing `pattern`.
    pub fn failing_on(pattern: &str) -> Self {
        Self {
            objects: ObjectMap::default(),
            fail_pattern: Some(pattern.to_string()),
        }
    }

    /// Snapshot of everything stored so far.
    pub fn objects(&self) -> BTreeMap<String, Vec<u8>> {
        self.objects
            .lock()
            .map(|objects| objects.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(key).cloned())
    }

    fn upload_error(key: &str, reason: impl Into<String>) -> ExportError {
        ExportError::Upload {
            shard: None,
            path: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Uploader for MemoryUploader {
    async fn upload(&self, key: &str, mut body: ByteStream) -> Result<UploadReceipt, ExportError> {
        let fails = self
            .fail_pattern
            .as_deref()
            .is_some_and(|pattern| key.contains(pattern));

        let mut data = Vec::new();
        while let Some(piece) = body.next().await {
            let chunk = piece.map_err(|e| Self::upload_error(key, e.to_string()))?;
            data.extend_from_slice(&chunk);
            if fails {
                return Err(Self::upload_error(key, "simulated transfer failure"));
            }
        }
        if fails {
            return Err(Self::upload_error(key, "simulated transfer failure"));
        }

        let receipt = UploadReceipt {
            bytes: data.len() as u64,
            etag: Some(format!("{:x}", Md5::digest(&data))),
        };
        self.objects
            .lock()
            .map_err(|_| Self::upload_error(key, "object map poisoned"))?
            .insert(key.to_string(), data);
        Ok(receipt)
    }
}

//! Storage backends that persist shard streams, manifests and config copies.

mod discard;
mod local;
mod memory;
mod store;

pub use discard::DiscardUploader;
pub use local::LocalUploader;
pub use memory::MemoryUploader;
pub use store::{ObjectStoreUploader, S3Config};

use async_trait::async_trait;

use crate::error::ExportError;
use crate::sink::ByteStream;

/// What storage reported back for a stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Bytes consumed from the stream.
    pub bytes: u64,
    /// Storage ETag with quotes trimmed, if the backend returns one.
    ///
    /// For simple (non-multipart) S3-style uploads this is the MD5 of the body.
    pub etag: Option<String>,
}

/// Durably persists one object from a byte stream.
///
/// An upload succeeds only if the whole stream was consumed without error;
/// a stream error must fail the upload rather than store a prefix.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, key: &str, body: ByteStream) -> Result<UploadReceipt, ExportError>;
}

/// Checks a receipt against what the sink produced.
///
/// Only an ETag that is a plain MD5 digest is compared. Multipart ETags
/// (`<md5>-<parts>`) and opaque backend versions are accepted on size alone.
pub fn verify_receipt(
    receipt: &UploadReceipt,
    expected_bytes: u64,
    expected_md5: &str,
) -> Result<(), String> {
    if receipt.bytes != expected_bytes {
        return Err(format!(
            "size mismatch: sent {} bytes, storage consumed {}",
            expected_bytes, receipt.bytes
        ));
    }
    match receipt.etag.as_deref() {
        Some(etag) if is_md5_digest(etag) && etag != expected_md5 => Err(format!(
            "MD5 mismatch: expected {}, storage reported {}",
            expected_md5, etag
        )),
        _ => Ok(()),
    }
}

fn is_md5_digest(etag: &str) -> bool {
    etag.len() == 32 && etag.chars().all(|c| c.is_ascii_hexdigit())
}

//! Bulk-load manifest listing every shard of a run.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ExportError;
use crate::layout::{bucket_url, RunLayout};
use crate::sink::single_chunk;
use crate::types::{ShardDescriptor, ShardStatus};
use crate::upload::Uploader;

/// One shard location in the manifest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub url: String,
    pub mandatory: bool,
}

/// `{"entries":[{"url":...,"mandatory":true}, ...]}`, entries in shard-index order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Builds the manifest for a run whose shards have all been uploaded.
    ///
    /// Any shard that is not `Uploaded` is an error: a manifest never lists a
    /// partial run.
    pub fn from_shards(bucket: &str, shards: &[ShardDescriptor]) -> Result<Self, ExportError> {
        let mut ordered: Vec<&ShardDescriptor> = shards.iter().collect();
        ordered.sort_by_key(|s| s.index);

        let entries = ordered
            .into_iter()
            .map(|shard| {
                if shard.status != ShardStatus::Uploaded {
                    return Err(ExportError::Manifest {
                        path: shard.output_path.clone(),
                        reason: format!("shard {} is {:?}, not uploaded", shard.index, shard.status),
                    });
                }
                Ok(ManifestEntry {
                    url: bucket_url(bucket, &shard.output_path),
                    mandatory: true,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { entries })
    }

    /// Serializes and uploads the manifest to the run's manifest key.
    ///
    /// # Returns
    ///
    /// The bucket-qualified URL of the manifest object.
    pub async fn publish(
        &self,
        bucket: &str,
        layout: &RunLayout,
        uploader: &dyn Uploader,
    ) -> Result<String, ExportError> {
        let key = layout.manifest_key();
        let manifest_error = |reason: String| ExportError::Manifest {
            path: key.clone(),
            reason,
        };

        let body = serde_json::to_vec(self).map_err(|e| manifest_error(e.to_string()))?;
        info!("Manifest file contents: {}", String::from_utf8_lossy(&body));

        uploader
            .upload(&key, single_chunk(body))
            .await
            .map_err(|e| manifest_error(e.to_string()))?;

        let url = bucket_url(bucket, &key);
        info!("✅ Published manifest {}", url);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::MemoryUploader;

    fn uploaded(index: usize, path: &str) -> ShardDescriptor {
        let mut shard = ShardDescriptor::new(index, path.to_string());
        shard.status = ShardStatus::Uploaded;
        shard
    }

    #[test]
    fn entries_follow_shard_index_order() {
        let shards = [uploaded(1, "t/b_1.json.gz"), uploaded(0, "t/b_0.json.gz")];
        let manifest = Manifest::from_shards("bkt", &shards).unwrap();
        let urls: Vec<&str> = manifest.entries.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, ["s3://bkt/t/b_0.json.gz", "s3://bkt/t/b_1.json.gz"]);
        assert!(manifest.entries.iter().all(|e| e.mandatory));
    }

    #[test]
    fn failed_shard_blocks_the_manifest() {
        let mut failed = uploaded(1, "t/b_1.json.gz");
        failed.status = ShardStatus::Failed;
        let shards = [uploaded(0, "t/b_0.json.gz"), failed];
        assert!(matches!(
            Manifest::from_shards("bkt", &shards),
            Err(ExportError::Manifest { .. })
        ));
    }

    #[tokio::test]
    async fn publishes_exact_body_at_manifest_key() {
        let layout = RunLayout::new("mongo", "students", "2016-01-27T21:00:00Z").unwrap();
        let shards = [uploaded(0, "k0"), uploaded(1, "k1")];
        let uploader = MemoryUploader::new();

        let url = Manifest::from_shards("bkt", &shards)
            .unwrap()
            .publish("bkt", &layout, &uploader)
            .await
            .unwrap();

        assert_eq!(url, format!("s3://bkt/{}", layout.manifest_key()));
        let body = uploader.get(&layout.manifest_key()).unwrap();
        assert_eq!(
            String::from_utf8(body).unwrap(),
            r#"{"entries":[{"url":"s3://bkt/k0","mandatory":true},{"url":"s3://bkt/k1","mandatory":true}]}"#
        );
    }

    #[tokio::test]
    async fn upload_failure_is_a_manifest_error() {
        let layout = RunLayout::new("mongo", "students", "2016-01-27T21:00:00Z").unwrap();
        let uploader = MemoryUploader::failing_on(".manifest");
        let err = Manifest { entries: vec![] }
            .publish("bkt", &layout, &uploader)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "manifest");
    }
}

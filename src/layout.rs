//! Run timestamp and object key layout.

use chrono::{DateTime, Datelike, DurationRound, SecondsFormat, TimeDelta, Utc};

use crate::error::ExportError;

/// Extension of compressed shard objects.
pub const SHARD_EXTENSION: &str = ".json.gz";
/// Extension of the bulk-load manifest object.
pub const MANIFEST_EXTENSION: &str = ".manifest";

/// Computes the reference timestamp for a run started at `now`.
///
/// Runs are labelled with the nearest hour to half an hour before they start,
/// formatted as RFC 3339 in UTC (e.g. `2024-01-01T00:00:00Z`).
pub fn run_timestamp(now: DateTime<Utc>) -> Result<String, ExportError> {
    let rounded = (now - TimeDelta::minutes(30))
        .duration_round(TimeDelta::hours(1))
        .map_err(|e| ExportError::Config(format!("cannot round run timestamp: {}", e)))?;
    Ok(rounded.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Builds the `s3://` URL that downstream loaders use for an object.
pub fn bucket_url(bucket: &str, key: &str) -> String {
    format!("s3://{}/{}", bucket, key)
}

/// Object keys for one run of one destination table.
///
/// Every key is a pure function of prefix, name and timestamp, so a shard's
/// path is known before any of its bytes exist.
#[derive(Debug, Clone)]
pub struct RunLayout {
    prefix: String,
    dest: String,
    timestamp: String,
    year: i32,
    month: u32,
    day: u32,
}

impl RunLayout {
    /// Parses the run timestamp once and fixes the layout for the run.
    pub fn new(prefix: &str, dest: &str, timestamp: &str) -> Result<Self, ExportError> {
        let parsed = DateTime::parse_from_rfc3339(timestamp).map_err(|e| {
            ExportError::Config(format!("invalid run timestamp '{}': {}", timestamp, e))
        })?;
        Ok(Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            dest: dest.to_string(),
            timestamp: timestamp.to_string(),
            year: parsed.year(),
            month: parsed.month(),
            day: parsed.day(),
        })
    }

    pub fn dest(&self) -> &str {
        &self.dest
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// Key of the compressed output of shard `index`.
    pub fn shard_key(&self, index: usize) -> String {
        self.key(&self.dest, Some(index), SHARD_EXTENSION)
    }

    /// Key of the manifest listing every shard of the run.
    pub fn manifest_key(&self) -> String {
        self.key(&self.dest, None, MANIFEST_EXTENSION)
    }

    /// Key of the copy of the table config the run used, filed under the config's name.
    pub fn config_key(&self, config_name: &str, extension: &str) -> String {
        self.key(config_name, None, extension)
    }

    fn key(&self, name: &str, index: Option<usize>, extension: &str) -> String {
        let index = index.map(|i| format!("_{}", i)).unwrap_or_default();
        let key = format!(
            "{name}/_data_timestamp_year={:02}/_data_timestamp_month={:02}/_data_timestamp_day={:02}/mongo_{name}_{}{}{}",
            self.year,
            self.month,
            self.day,
            self.timestamp,
            index,
            extension,
            name = name,
        );
        if self.prefix.is_empty() {
            key
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }
}

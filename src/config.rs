//! Table configuration file loading.
//!
//! A config file holds the source connection and any number of named tables:
//!
//! ```toml
//! url = "mongodb://localhost:27017/school"
//!
//! [tables.students]
//! source = "students"
//! dest = "students"
//! columns = [
//!     { source = "name.first", dest = "first_name" },
//!     { source = "ssn", dest = "has_ssn", pii = true },
//! ]
//! meta = { datadatecolumn = "_data_timestamp", projection_optimization = true }
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::ExportError;
use crate::layout::{bucket_url, RunLayout};
use crate::sink::single_chunk;
use crate::types::TableSpec;
use crate::upload::Uploader;

/// Parsed table configuration file.
#[derive(Deserialize, Debug, Clone)]
pub struct ConfigFile {
    /// MongoDB connection string.
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tables: BTreeMap<String, TableSpec>,
}

impl ConfigFile {
    /// Parses config text and validates every table in it.
    pub fn parse(text: &str) -> Result<Self, ExportError> {
        let config: ConfigFile = toml::from_str(text)?;
        if config.url.is_empty() {
            return Err(ExportError::Config("config file has an empty url".into()));
        }
        for table in config.tables.values() {
            table.validate()?;
        }
        debug!("Loaded {} table definitions", config.tables.len());
        Ok(config)
    }

    /// Reads and parses a config file, keeping its raw text for the run's config copy.
    pub fn load(path: &Path) -> Result<(Self, ConfigSnapshot), ExportError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ExportError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&contents)?;

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("config")
            .to_string();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|ext| format!(".{}", ext))
            .unwrap_or_else(|| ".toml".to_string());

        Ok((
            config,
            ConfigSnapshot {
                name,
                contents,
                extension,
            },
        ))
    }

    /// The table whose source collection is `collection`.
    pub fn table_for_source(&self, collection: &str) -> Result<&TableSpec, ExportError> {
        if collection.is_empty() {
            return Err(ExportError::Config("a source collection is required".into()));
        }
        self.tables
            .values()
            .find(|table| table.source_collection == collection)
            .ok_or_else(|| {
                ExportError::Config(format!(
                    "collection '{}' does not exist in the config file",
                    collection
                ))
            })
    }
}

/// Raw text of the config a run used, uploaded next to its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    /// File stem of the config, used as the object name.
    pub name: String,
    pub contents: String,
    /// Extension including the leading dot.
    pub extension: String,
}

impl ConfigSnapshot {
    /// Uploads the config copy and returns its bucket-qualified URL.
    pub async fn publish(
        &self,
        bucket: &str,
        layout: &RunLayout,
        uploader: &dyn Uploader,
    ) -> Result<String, ExportError> {
        let key = layout.config_key(&self.name, &self.extension);
        uploader
            .upload(&key, single_chunk(self.contents.clone().into_bytes()))
            .await
            .map_err(|e| e.into_upload(None, &key))?;
        let url = bucket_url(bucket, &key);
        info!("Uploaded config copy to {}", url);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArrayKeyStyle;
    use crate::upload::MemoryUploader;
    use std::io::Write;

    const CONFIG: &str = r#"
url = "mongodb://localhost:27017/school"
user = "reader"

[tables.students]
source = "students"
dest = "student_rows"
columns = [
    { source = "name.first", dest = "first_name" },
    { source = "ssn", dest = "has_ssn", pii = true },
]
meta = { projection_optimization = true, array_keys = "shared" }

[tables.courses]
source = "courses"
dest = "courses"
"#;

    #[test]
    fn parses_tables_with_defaults() {
        let config = ConfigFile::parse(CONFIG).unwrap();
        assert_eq!(config.user.as_deref(), Some("reader"));
        assert_eq!(config.password, None);

        let students = config.table_for_source("students").unwrap();
        assert_eq!(students.dest_name, "student_rows");
        assert_eq!(students.fields.len(), 2);
        assert!(students.fields[1].is_sensitive);
        assert!(!students.fields[0].is_sensitive);
        assert_eq!(students.metadata.date_column, "_data_timestamp");
        assert!(students.metadata.use_projection);
        assert_eq!(students.metadata.array_keys, ArrayKeyStyle::Shared);

        let courses = config.table_for_source("courses").unwrap();
        assert!(courses.fields.is_empty());
        assert_eq!(courses.metadata.array_keys, ArrayKeyStyle::Indexed);
    }

    #[test]
    fn unknown_or_empty_collection_is_a_config_error() {
        let config = ConfigFile::parse(CONFIG).unwrap();
        assert!(matches!(
            config.table_for_source("parents"),
            Err(ExportError::Config(_))
        ));
        assert!(matches!(
            config.table_for_source(""),
            Err(ExportError::Config(_))
        ));
    }

    #[test]
    fn invalid_table_is_rejected() {
        let text = r#"
url = "mongodb://localhost/db"
[tables.broken]
source = "things"
dest = ""
"#;
        assert!(matches!(ConfigFile::parse(text), Err(ExportError::Config(_))));
        assert!(matches!(
            ConfigFile::parse("url = 5"),
            Err(ExportError::TomlError(_))
        ));
    }

    #[tokio::test]
    async fn loads_and_publishes_config_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("school.toml");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(CONFIG.as_bytes())
            .unwrap();

        let (_, snapshot) = ConfigFile::load(&path).unwrap();
        assert_eq!(snapshot.name, "school");
        assert_eq!(snapshot.extension, ".toml");

        let layout = RunLayout::new("mongo", "student_rows", "2016-01-27T21:00:00Z").unwrap();
        let uploader = MemoryUploader::new();
        let url = snapshot.publish("bkt", &layout, &uploader).await.unwrap();

        let key = layout.config_key("school", ".toml");
        assert_eq!(url, format!("s3://bkt/{}", key));
        assert_eq!(uploader.get(&key).unwrap(), CONFIG.as_bytes());
    }
}

//! MongoDB-backed row source.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{ClientOptions, Credential, FindOptions};
use mongodb::{Client, Cursor};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::ExportError;
use crate::source::RowSource;
use crate::types::{Row, TableSpec};

/// Documents fetched per round trip to the server.
pub const DEFAULT_BATCH_SIZE: u32 = 1000;

/// Streams every document of a collection, optionally projected to the
/// table's source fields.
pub struct MongoRowSource {
    cursor: Cursor<Document>,
    collection: String,
    fetched: u64,
}

impl MongoRowSource {
    /// Connects and opens a cursor over the whole collection of `table`.
    ///
    /// # Arguments
    ///
    /// * `url` - MongoDB connection string
    /// * `user` / `password` - Credentials overriding those in the URL, if any
    /// * `table` - Table whose collection (and projection) to read
    /// * `batch_size` - Documents fetched per round trip
    pub async fn open(
        url: &str,
        user: Option<&str>,
        password: Option<&str>,
        table: &TableSpec,
        batch_size: u32,
    ) -> Result<Self, ExportError> {
        let mut options = ClientOptions::parse(url).await?;
        if let Some(user) = user.filter(|u| !u.is_empty()) {
            let mut credential = Credential::default();
            credential.username = Some(user.to_string());
            credential.password = password.filter(|p| !p.is_empty()).map(str::to_string);
            options.credential = Some(credential);
        }
        let client = Client::with_options(options)?;

        let database = match table.metadata.database.as_deref() {
            Some(name) => client.database(name),
            None => client.default_database().ok_or_else(|| {
                ExportError::Config("connection URL names no database and the table sets none".into())
            })?,
        };

        let mut find_options = FindOptions::default();
        find_options.batch_size = Some(batch_size);
        find_options.projection = table.projection_paths().map(|paths| projection(&paths));
        if find_options.projection.is_some() {
            debug!(
                "Projecting {} fields from {}",
                table.fields.len(),
                table.source_collection
            );
        }

        let cursor = database
            .collection::<Document>(&table.source_collection)
            .find(doc! {})
            .with_options(find_options)
            .await?;
        info!(
            "Opened cursor on {}.{}",
            database.name(),
            table.source_collection
        );

        Ok(Self {
            cursor,
            collection: table.source_collection.clone(),
            fetched: 0,
        })
    }
}

#[async_trait]
impl RowSource for MongoRowSource {
    async fn next_row(&mut self) -> Result<Option<Row>, ExportError> {
        match self.cursor.try_next().await? {
            Some(document) => {
                self.fetched += 1;
                Ok(Some(document_to_row(document)))
            }
            None => {
                debug!(
                    "Cursor on {} exhausted after {} documents",
                    self.collection, self.fetched
                );
                Ok(None)
            }
        }
    }
}

/// `{path: 1, ...}` for every requested path.
fn projection(paths: &[&str]) -> Document {
    paths.iter().map(|path| (path.to_string(), Bson::Int32(1))).collect()
}

/// Converts a BSON document into a (still nested) row.
pub fn document_to_row(document: Document) -> Row {
    document
        .into_iter()
        .map(|(key, value)| (key, bson_to_json(value)))
        .collect()
}

fn bson_to_json(value: Bson) -> Value {
    match value {
        Bson::Document(document) => Value::Object(document_to_row(document)),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_json).collect()),
        Bson::String(s) | Bson::Symbol(s) | Bson::JavaScriptCode(s) => Value::String(s),
        Bson::Int32(n) => Value::from(n),
        Bson::Int64(n) => Value::from(n),
        Bson::Double(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .map(Value::String)
            .unwrap_or(Value::Null),
        Bson::Decimal128(d) => Value::String(d.to_string()),
        Bson::Timestamp(ts) => Value::from(ts.time),
        Bson::Binary(bin) => Value::String(bin.bytes.iter().map(|b| format!("{:02x}", b)).collect()),
        other => other.into_relaxed_extjson(),
    }
}

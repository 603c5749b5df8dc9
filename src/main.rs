use anyhow::Context;
use clap::Parser;
use mongo_s3_export::mongo::DEFAULT_BATCH_SIZE;
use mongo_s3_export::{
    run_export, run_timestamp, ConfigFile, DiscardUploader, ExportConfig, ExportError,
    JsonLinesSource, LocalUploader, MongoRowSource, ObjectStoreUploader, RowSource, S3Config,
    Uploader,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mongo-s3-export")]
#[command(about = "Export a MongoDB collection to sharded, gzipped JSON in object storage", long_about = None)]
#[command(version)]
struct Args {
    /// Table config file (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Source collection to export; selects the table from the config file
    #[arg(long)]
    collection: String,

    /// Destination bucket
    #[arg(short, long)]
    bucket: String,

    /// Number of output files written in parallel
    #[arg(short, long, default_value_t = 1)]
    num_files: usize,

    /// Leading key component for every object
    #[arg(long, default_value = "mongo")]
    prefix: String,

    /// S3-compatible endpoint (MinIO, R2, ...); defaults to AWS
    #[arg(long, conflicts_with_all = ["output_dir", "dry_run"])]
    endpoint: Option<String>,

    /// S3 region; defaults to AWS_REGION from the environment
    #[arg(long, conflicts_with_all = ["output_dir", "dry_run"])]
    region: Option<String>,

    /// Write objects under this directory instead of uploading
    #[arg(long, conflicts_with = "dry_run")]
    output_dir: Option<PathBuf>,

    /// Stream and checksum every object without storing it
    #[arg(long)]
    dry_run: bool,

    /// Read documents from a JSON-lines file instead of MongoDB
    #[arg(long)]
    input: Option<PathBuf>,

    /// Run timestamp (RFC 3339); defaults to the nearest hour half an hour ago
    #[arg(long)]
    timestamp: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("mongo_s3_export={}", log_level))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(args).await {
        match e.downcast_ref::<ExportError>() {
            Some(export) => eprintln!("❌ Export failed during {}: {:#}", export.stage(), e),
            None => eprintln!("❌ Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    info!("🚀 mongo-s3-export");
    info!("Collection: {}", args.collection);
    info!("Bucket: {}", args.bucket);
    info!("Files: {}", args.num_files);

    let (file, snapshot) = ConfigFile::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let table = file.table_for_source(&args.collection)?;

    let config = ExportConfig {
        bucket: args.bucket.clone(),
        key_prefix: args.prefix.clone(),
        num_shards: args.num_files,
        ..ExportConfig::default()
    };
    config.validate()?;

    let timestamp = match args.timestamp {
        Some(timestamp) => timestamp,
        None => run_timestamp(chrono::Utc::now())?,
    };

    let uploader: Arc<dyn Uploader> = match (&args.output_dir, args.dry_run) {
        (Some(dir), _) => {
            info!("Writing objects under {}", dir.display());
            Arc::new(LocalUploader::new(dir, &args.bucket))
        }
        (None, true) => {
            info!("Dry run: objects are streamed and discarded");
            Arc::new(DiscardUploader)
        }
        (None, false) => Arc::new(ObjectStoreUploader::s3(&S3Config {
            bucket: args.bucket.clone(),
            region: args.region.clone(),
            endpoint: args.endpoint.clone(),
        })?),
    };

    let source: Box<dyn RowSource> = match &args.input {
        Some(path) => Box::new(
            JsonLinesSource::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?,
        ),
        None => Box::new(
            MongoRowSource::open(
                &file.url,
                file.user.as_deref(),
                file.password.as_deref(),
                table,
                DEFAULT_BATCH_SIZE,
            )
            .await?,
        ),
    };

    let summary = run_export(&config, table, &timestamp, source, uploader, Some(&snapshot)).await?;

    info!(
        "✅ Export completed in {}",
        humantime::format_duration(std::time::Duration::from_secs(summary.elapsed.as_secs()))
    );
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

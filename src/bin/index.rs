use clap::Parser;
use ragsync::{Config, IndexRequest, Pipeline};
use std::path::PathBuf;
use anyhow::Result;

#[derive(Parser, Debug)]
#[command(name = "index")]
#[command(about = "Sync the source tree into the chunk store and rebuild the search store (incremental by default)")]
struct Args {
    /// Process every file, ignoring the fingerprint registry
    #[arg(short, long)]
    force: bool,

    /// Source directory (defaults to [ingest].source_dir)
    #[arg(long)]
    source_dir: Option<PathBuf>,

    /// Processed directory (defaults to [ingest].processed_dir)
    #[arg(long)]
    processed_dir: Option<PathBuf>,

    /// Chunk size in characters
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Overlap between chunks in characters
    #[arg(long)]
    chunk_overlap: Option<usize>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let args = Args::parse();
    let config = Config::load()?;

    let pipeline = Pipeline::from_config(&config)?;
    pipeline.ensure_schema(config.migrations_dir()).await?;
    log::info!("Database initialized");

    let cancel = pipeline.cancel_flag().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, stopping after the current batch");
            cancel.cancel();
        }
    });

    let mut request = IndexRequest::from_config(&config, !args.force);
    if let Some(dir) = args.source_dir {
        request.source_dir = dir;
    }
    if let Some(dir) = args.processed_dir {
        request.processed_dir = dir;
    }
    if let Some(size) = args.chunk_size {
        request.chunk_size = size;
    }
    if let Some(overlap) = args.chunk_overlap {
        request.chunk_overlap = overlap;
    }
    log::info!(
        "Mode: {} | source: {} | chunks: {}/{}",
        if request.incremental { "incremental" } else { "full" },
        request.source_dir.display(),
        request.chunk_size,
        request.chunk_overlap
    );

    let report = pipeline.index(request).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("\n=== Indexing Summary ===");
        println!("Documents indexed: {}", report.document_count);
        println!("Chunks written:    {}", report.chunk_count);
        println!("Unchanged files:   {}", report.unchanged_files);
        println!("Deleted files:     {}", report.deleted_files);
        println!("Failed files:      {}", report.failed_files);
        println!("Skipped files:     {}", report.skipped_files);
        println!("Search store rows: {}", report.search_rows);
        println!("Time:              {:.2}s", report.processing_time_seconds);
    }

    if !report.success {
        anyhow::bail!(report.error.unwrap_or(report.message));
    }
    Ok(())
}

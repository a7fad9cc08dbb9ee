use clap::Parser;
use ragsync::{Config, Pipeline};
use ragsync::fingerprint::FingerprintRegistry;
use ragsync::store::{chunk_store, search_store};
use anyhow::Result;

#[derive(Parser, Debug)]
#[command(name = "stats")]
#[command(about = "Per-file chunk counts of both stores and registry size")]
struct Args {
    /// Only list files whose counts differ between the two stores
    #[arg(long)]
    diff: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config::load()?;
    let pipeline = Pipeline::from_config(&config)?;
    pipeline.ensure_schema(config.migrations_dir()).await?;

    let stats = pipeline.stats().await?;
    let chunk_counts = chunk_store::count_by_file(pipeline.db()).await?;
    let search_counts = search_store::count_by_file(pipeline.db()).await?;
    let registry = FingerprintRegistry::load(&config.ingest.processed_dir)?;

    println!("\n=== ragsync Store Statistics ===\n");
    println!("Chunk store rows:     {}", stats.chunk_rows);
    println!("Search store rows:    {}", stats.search_rows);
    println!("Files:                {}", stats.files);
    println!("Registry entries:     {}", registry.len());
    if let Some(index) = &stats.index {
        println!(
            "Index:                {} lists ({} trained) over {} rows, dim {}",
            index.lists, index.trained_lists, index.row_count, index.dimension
        );
    }

    println!("\n{:-<80}", "");
    println!("{:<60} {:>8} {:>8}", "File", "Chunks", "Search");
    println!("{:-<80}", "");
    for (file, chunks) in &chunk_counts {
        let searchable = search_counts.get(file).copied().unwrap_or(0);
        if args.diff && searchable == *chunks {
            continue;
        }
        println!("{:<60} {:>8} {:>8}", file, chunks, searchable);
    }
    for (file, searchable) in &search_counts {
        if !chunk_counts.contains_key(file) {
            println!("{:<60} {:>8} {:>8}", file, 0, searchable);
        }
    }
    println!("{:-<80}", "");
    Ok(())
}

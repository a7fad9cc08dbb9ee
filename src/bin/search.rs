use clap::Parser;
use ragsync::{Config, Pipeline};
use ragsync::search::ResultKind;
use std::time::Instant;
use anyhow::Result;

#[derive(Parser, Debug)]
#[command(name = "search")]
#[command(about = "Semantic search over the search store")]
struct Args {
    /// Query text
    query: String,

    /// Maximum number of matches (defaults to [search].default_limit)
    #[arg(short = 'k', long)]
    limit: Option<usize>,

    /// Minimum similarity (defaults to [search].similarity_threshold)
    #[arg(short, long)]
    threshold: Option<f32>,

    /// Compare against every row instead of probing the index
    #[arg(long)]
    exact: bool,

    /// Index lists to probe
    #[arg(long)]
    probes: Option<usize>,

    /// Include neighbouring chunks of each match
    #[arg(long)]
    with_context: bool,

    /// Neighbours on each side when --with-context is set
    #[arg(long, default_value_t = 1)]
    context_size: usize,

    /// Include every chunk of each matched file
    #[arg(long)]
    full_document: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "warn")
    ).init();

    let args = Args::parse();
    if args.query.trim().is_empty() {
        anyhow::bail!("Query cannot be empty");
    }

    let config = Config::load()?;
    let pipeline = Pipeline::from_config(&config)?;

    let mut options = pipeline.search_options();
    if let Some(limit) = args.limit {
        options.limit = limit;
    }
    if let Some(threshold) = args.threshold {
        options.threshold = threshold;
    }
    options.exact = args.exact;
    options.probes = args.probes;
    options.with_context = args.with_context;
    options.context_size = args.context_size;
    options.full_document = args.full_document;

    let start = Instant::now();
    let results = pipeline.search(&args.query, &options).await?;
    let duration = start.elapsed();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    println!("\n=== Search Results ===");
    println!("Query: \"{}\"\n", args.query);

    if results.is_empty() {
        println!("No results found.");
    } else {
        for (rank, result) in results.iter().enumerate() {
            println!("─────────────────────────────────────────────────────────────────────────────");
            let marker = match result.kind {
                ResultKind::Match => "match",
                ResultKind::Context => "context",
                ResultKind::FullDocument => "document",
            };
            println!(
                "#{} [{}] {} chunk {} (similarity: {:.3})",
                rank + 1,
                marker,
                result.filename,
                result.chunk_index,
                result.similarity
            );
            if let Some(ref original) = result.original_filepath {
                println!("Source: {}", original);
            }

            let preview: String = result.chunk_text.chars().take(200).collect();
            let ellipsis = if result.chunk_text.chars().count() > 200 { "..." } else { "" };
            println!("\n{}{}\n", preview, ellipsis);
        }
        println!("─────────────────────────────────────────────────────────────────────────────");
    }

    println!("\nResults: {}", results.len());
    println!("Latency: {:?}", duration);
    println!("Mode: {}", if options.exact { "exact" } else { "approximate" });
    println!("Threshold: {:.2}", options.threshold);
    Ok(())
}

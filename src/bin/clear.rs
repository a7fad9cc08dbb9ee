use clap::Parser;
use ragsync::{Config, Pipeline};
use anyhow::Result;

#[derive(Parser, Debug)]
#[command(name = "clear")]
#[command(about = "Delete every chunk, empty the search store and forget all fingerprints")]
struct Args {
    /// Required to actually delete anything
    #[arg(short, long)]
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let args = Args::parse();
    if !args.yes {
        anyhow::bail!("Refusing to clear without --yes");
    }

    let config = Config::load()?;
    let pipeline = Pipeline::from_config(&config)?;
    pipeline.ensure_schema(config.migrations_dir()).await?;

    let report = pipeline.clear().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.success {
        anyhow::bail!(report.error.unwrap_or_else(|| "clear failed".to_string()));
    }
    Ok(())
}

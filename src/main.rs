use clap::{Parser, Subcommand};
use ragsync::Config;
use ragsync::db::{migrate, Db};
use ragsync::error::RagsyncError;
use ragsync::store::{CHUNK_TABLE, SEARCH_TABLE};
use ragsync::Pipeline;
use anyhow::{Context, Result};

#[derive(Parser, Debug)]
#[command(name = "ragsync")]
#[command(about = "Two-tier vector store: schema verification and status")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply migrations and verify the schema (default)
    Verify,
    /// Show row counts of both stores and the index
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let args = Args::parse();
    let config = Config::load()?;

    match args.command.unwrap_or(Command::Verify) {
        Command::Verify => run_schema_verification(&config).await,
        Command::Status => run_status(&config).await,
    }
}

/// Run database schema verification
async fn run_schema_verification(config: &Config) -> Result<()> {
    log::info!("Starting ragsync v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Source dir: {}", config.ingest.source_dir.display());
    log::info!("Database path: {}", config.db_path().display());
    log::info!("Embedding model: {} ({} dims)", config.embeddings.model, config.embeddings.dimensions);

    let db = Db::new(config.db_path());
    let migrations_dir = config.migrations_dir().to_path_buf();
    db.with_connection(move |conn| migrate::run_migrations(conn, &migrations_dir))
        .await
        .context("Failed to apply migrations")?;
    log::info!("Database initialized successfully");

    verify_database_schema(&db).await?;
    Ok(())
}

/// Verify that all expected database objects exist
async fn verify_database_schema(db: &Db) -> Result<()> {
    db.with_connection(|conn| {
        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
        let tables: Vec<String> = stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        for table in [CHUNK_TABLE, SEARCH_TABLE, "schema_migrations"] {
            if !tables.iter().any(|t| t == table) {
                return Err(RagsyncError::Config(format!("Missing table: {}", table)));
            }
            log::debug!("✓ Table exists: {}", table);
        }

        let applied = migrate::get_applied_migrations(conn)?;
        log::debug!("✓ {} migrations applied", applied.len());

        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if journal_mode.to_uppercase() != "WAL" {
            return Err(RagsyncError::Config(format!("Journal mode is not WAL: {}", journal_mode)));
        }
        log::debug!("✓ Journal mode: WAL");

        let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if integrity != "ok" {
            return Err(RagsyncError::Config(format!("Database integrity check failed: {}", integrity)));
        }
        log::info!("✓ Database integrity: OK");
        Ok(())
    }).await?;

    log::info!("✓ Database schema verification complete");
    Ok(())
}

async fn run_status(config: &Config) -> Result<()> {
    let pipeline = Pipeline::from_config(config)?;
    pipeline.ensure_schema(config.migrations_dir()).await?;
    let stats = pipeline.stats().await?;

    println!("\n=== ragsync status ===\n");
    println!("Chunk store rows:  {}", stats.chunk_rows);
    println!("Search store rows: {}", stats.search_rows);
    println!("Files:             {}", stats.files);
    match stats.index {
        Some(index) => println!(
            "Index:             {} ({} lists, {} trained, built {})",
            index.index_name, index.lists, index.trained_lists, index.built_at
        ),
        None => println!("Index:             none (search store never rebuilt)"),
    }
    if stats.chunk_rows != stats.search_rows {
        println!("\n⚠️  Search store is behind the chunk store; run `index` to rebuild");
    }
    Ok(())
}

//! Numbered SQL migrations, applied once each and recorded in `schema_migrations`.

use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use crate::error::{Result, RagsyncError};

const MIGRATIONS_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)";

/// One `NNN_description.sql` file
#[derive(Debug)]
struct Migration {
    version: u32,
    name: String,
    path: PathBuf,
}

impl Migration {
    /// Parse `path` as a migration; None for anything that is not `*.sql`
    fn from_path(path: PathBuf) -> Result<Option<Self>> {
        if path.extension().and_then(|s| s.to_str()) != Some("sql") {
            return Ok(None);
        }
        let name = path
            .file_stem()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RagsyncError::Config(format!("Invalid migration filename: {}", path.display())))?
            .to_string();

        let (prefix, _) = name.split_once('_').unwrap_or((name.as_str(), ""));
        let version = prefix
            .parse::<u32>()
            .map_err(|_| RagsyncError::Config(format!("Migration {} does not start with a version number", name)))?;

        Ok(Some(Self { version, name, path }))
    }
}

/// Names of applied migrations, oldest first
pub fn get_applied_migrations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM schema_migrations ORDER BY version")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(names)
}

/// Migrations found in `migrations_dir`, keyed and ordered by version
fn discover(migrations_dir: &Path) -> Result<BTreeMap<u32, Migration>> {
    let entries = fs::read_dir(migrations_dir).map_err(|e| {
        RagsyncError::Config(format!(
            "Cannot read migrations directory {}: {}",
            migrations_dir.display(),
            e
        ))
    })?;

    let mut found: BTreeMap<u32, Migration> = BTreeMap::new();
    for entry in entries {
        let Some(migration) = Migration::from_path(entry?.path())? else {
            continue;
        };
        if let Some(other) = found.get(&migration.version) {
            return Err(RagsyncError::Config(format!(
                "Migrations {} and {} share version {}",
                other.name, migration.name, migration.version
            )));
        }
        found.insert(migration.version, migration);
    }
    Ok(found)
}

/// Apply every migration in `migrations_dir` whose version is not recorded yet.
///
/// Each migration runs in its own transaction together with its
/// `schema_migrations` row.
pub fn run_migrations(conn: &mut Connection, migrations_dir: &Path) -> Result<()> {
    conn.execute(MIGRATIONS_TABLE_DDL, [])?;

    let applied: Vec<u32> = {
        let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
        let versions = stmt
            .query_map([], |row| row.get::<_, u32>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        drop(stmt);
        versions
    };

    let mut count = 0;
    for (version, migration) in discover(migrations_dir)? {
        if applied.contains(&version) {
            continue;
        }

        let sql = fs::read_to_string(&migration.path)?;
        log::info!("Applying migration {}", migration.name);

        let tx = conn.transaction()?;
        tx.execute_batch(&sql).map_err(|e| {
            log::error!("Migration {} failed: {}", migration.name, e);
            RagsyncError::Database(e)
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            params![version, migration.name],
        )?;
        tx.commit()?;
        count += 1;
    }

    log::debug!("{} migrations applied, {} already present", count, applied.len());
    Ok(())
}

//! Inverted-file (IVF) ANN index over a record table's embeddings.
//!
//! An index on table `T` is three side tables:
//! - `T_embedding_idx_centroids` - one unit-length centroid per list
//! - `T_embedding_idx_lists` - posting table `(list_id, row_id)`
//! - `T_embedding_idx_meta` - a single row describing the build
//!
//! The index is built once over a complete table and never maintained
//! incrementally; rebuilding the search store rebuilds it.

pub mod kmeans;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use crate::error::{Result, RagsyncError};
use crate::store::{blob_to_embedding, embedding_to_blob, validate_dimension};

pub use kmeans::KMEANS_ITERATIONS;

/// Upper bound on rows sampled for centroid training
pub const MAX_TRAINING_ROWS: usize = 20_000;

/// Rows per posting-table insert transaction during assignment
const ASSIGN_BATCH: usize = 1000;

/// Cluster-count heuristic.
///
/// `lists = sqrt(N)` between a floor and a cap is general IVF guidance, so
/// every threshold is adjustable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexParams {
    /// Lists used below `small_table_rows`
    pub min_lists: usize,
    pub small_table_rows: usize,
    /// Lists used at or above `large_table_rows`
    pub max_lists: usize,
    pub large_table_rows: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            min_lists: 10,
            small_table_rows: 1000,
            max_lists: 1000,
            large_table_rows: 1_000_000,
        }
    }
}

impl IndexParams {
    pub fn lists_for(&self, rows: usize) -> usize {
        if rows < self.small_table_rows {
            self.min_lists
        } else if rows < self.large_table_rows {
            ((rows as f64).sqrt().floor() as usize).max(1)
        } else {
            self.max_lists
        }
    }
}

/// Number of lists for a table of `rows` rows, with default parameters
pub fn lists_for_rows(rows: usize) -> usize {
    IndexParams::default().lists_for(rows)
}

/// Metadata row of a built index
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexInfo {
    pub index_name: String,
    /// Lists requested by the heuristic
    pub lists: usize,
    /// Centroids actually trained, `min(lists, row_count)`
    pub trained_lists: usize,
    pub row_count: usize,
    pub dimension: usize,
    pub built_at: String,
}

/// A trained list centroid
#[derive(Debug, Clone, PartialEq)]
pub struct Centroid {
    pub list_id: i64,
    pub vector: Vec<f32>,
}

pub fn index_name(table: &str) -> String {
    format!("{}_embedding_idx", table)
}

fn centroids_table(table: &str) -> String {
    format!("{}_embedding_idx_centroids", table)
}

pub(crate) fn lists_table(table: &str) -> String {
    format!("{}_embedding_idx_lists", table)
}

fn meta_table(table: &str) -> String {
    format!("{}_embedding_idx_meta", table)
}

fn artifact_tables(table: &str) -> [String; 3] {
    [centroids_table(table), lists_table(table), meta_table(table)]
}

/// Create empty index tables for `table` if they are missing.
///
/// An index exists once its meta table holds a row.
pub fn create_index_tables(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {centroids} (list_id INTEGER PRIMARY KEY, centroid BLOB NOT NULL);
         CREATE TABLE IF NOT EXISTS {lists} (
             list_id INTEGER NOT NULL,
             row_id INTEGER NOT NULL,
             PRIMARY KEY (list_id, row_id)
         ) WITHOUT ROWID;
         CREATE TABLE IF NOT EXISTS {meta} (
             index_name TEXT PRIMARY KEY,
             lists INTEGER NOT NULL,
             trained_lists INTEGER NOT NULL,
             row_count INTEGER NOT NULL,
             dimension INTEGER NOT NULL,
             built_at TEXT NOT NULL
         );",
        centroids = centroids_table(table),
        lists = lists_table(table),
        meta = meta_table(table),
    ))?;
    Ok(())
}

/// Build (or rebuild) the IVF index over `table`.
///
/// Any existing index on the table is dropped first. Centroids are trained on
/// an evenly strided sample of at most `MAX_TRAINING_ROWS` rows, then every
/// row is assigned to its nearest centroid. An empty table gets an index
/// with no centroids.
pub fn build_index(conn: &mut Connection, table: &str, dim: usize, params: &IndexParams) -> Result<IndexInfo> {
    drop_index(conn, table)?;

    let row_count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
    let row_count = row_count as usize;
    let lists = params.lists_for(row_count);

    let sample = training_sample(conn, table, dim, row_count)?;
    let centroids = kmeans::train(&sample, lists, KMEANS_ITERATIONS);
    drop(sample);

    let tx = conn.transaction()?;
    create_index_tables(&tx, table)?;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {} (list_id, centroid) VALUES (?1, ?2)",
            centroids_table(table)
        ))?;
        for (list_id, centroid) in centroids.iter().enumerate() {
            stmt.execute(params![list_id as i64, embedding_to_blob(centroid)])?;
        }
    }
    tx.commit()?;

    if !centroids.is_empty() {
        assign_rows(conn, table, dim, &centroids)?;
    }

    let info = IndexInfo {
        index_name: index_name(table),
        lists,
        trained_lists: centroids.len(),
        row_count,
        dimension: dim,
        built_at: Utc::now().to_rfc3339(),
    };
    conn.execute(
        &format!(
            "INSERT INTO {} (index_name, lists, trained_lists, row_count, dimension, built_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            meta_table(table)
        ),
        params![
            info.index_name,
            info.lists as i64,
            info.trained_lists as i64,
            info.row_count as i64,
            info.dimension as i64,
            info.built_at,
        ],
    )?;

    log::info!(
        "Built index {} ({} rows, {} lists, {} trained)",
        info.index_name,
        info.row_count,
        info.lists,
        info.trained_lists
    );
    Ok(info)
}

/// Every `ceil(n / MAX_TRAINING_ROWS)`-th row, in id order
fn training_sample(conn: &Connection, table: &str, dim: usize, row_count: usize) -> Result<Vec<Vec<f32>>> {
    let stride = ((row_count + MAX_TRAINING_ROWS - 1) / MAX_TRAINING_ROWS).max(1);
    let mut stmt = conn.prepare(&format!("SELECT embedding FROM {} ORDER BY id", table))?;
    let mut rows = stmt.query([])?;
    let mut sample = Vec::with_capacity(row_count.min(MAX_TRAINING_ROWS));
    let mut position = 0usize;
    while let Some(row) = rows.next()? {
        if position % stride == 0 {
            let blob: Vec<u8> = row.get(0)?;
            let embedding = blob_to_embedding(&blob)?;
            validate_dimension(&embedding, dim)?;
            sample.push(embedding);
        }
        position += 1;
    }
    Ok(sample)
}

fn assign_rows(conn: &mut Connection, table: &str, dim: usize, centroids: &[Vec<f32>]) -> Result<()> {
    let mut assignments: Vec<(i64, i64)> = Vec::with_capacity(ASSIGN_BATCH);
    let mut after_id = i64::MIN;
    let select = format!("SELECT id, embedding FROM {} WHERE id > ?1 ORDER BY id LIMIT ?2", table);
    let insert = format!("INSERT INTO {} (list_id, row_id) VALUES (?1, ?2)", lists_table(table));

    loop {
        assignments.clear();
        {
            let mut stmt = conn.prepare_cached(&select)?;
            let mut rows = stmt.query(params![after_id, ASSIGN_BATCH as i64])?;
            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                let embedding = blob_to_embedding(&blob)?;
                validate_dimension(&embedding, dim)?;
                assignments.push((kmeans::nearest(centroids, &embedding) as i64, id));
            }
        }

        let Some(&(_, last_id)) = assignments.last() else {
            break;
        };

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&insert)?;
            for (list_id, row_id) in &assignments {
                stmt.execute(params![list_id, row_id])?;
            }
        }
        tx.commit()?;
        after_id = last_id;
    }

    Ok(())
}

/// Drop the index artifacts of `table`, if any
pub fn drop_index(conn: &Connection, table: &str) -> Result<()> {
    for artifact in artifact_tables(table) {
        conn.execute(&format!("DROP TABLE IF EXISTS {}", artifact), [])?;
    }
    Ok(())
}

/// Move the index of `from` so it belongs to table `to`.
///
/// Used when a fully built shadow table is renamed over the live one; the
/// caller has already dropped `to`'s own index tables.
pub(crate) fn rename_index(conn: &Connection, from: &str, to: &str) -> Result<()> {
    for (old, new) in artifact_tables(from).iter().zip(artifact_tables(to).iter()) {
        conn.execute(&format!("ALTER TABLE {} RENAME TO {}", old, new), [])?;
    }
    conn.execute(
        &format!("UPDATE {} SET index_name = ?1", meta_table(to)),
        params![index_name(to)],
    )?;
    Ok(())
}

/// Metadata of the index on `table`, or None when it has never been built.
///
/// The index tables must exist (see `create_index_tables`).
pub fn index_info(conn: &Connection, table: &str) -> Result<Option<IndexInfo>> {
    let info = conn
        .query_row(
            &format!(
                "SELECT index_name, lists, trained_lists, row_count, dimension, built_at FROM {}",
                meta_table(table)
            ),
            [],
            |row| {
                Ok(IndexInfo {
                    index_name: row.get(0)?,
                    lists: row.get::<_, i64>(1)? as usize,
                    trained_lists: row.get::<_, i64>(2)? as usize,
                    row_count: row.get::<_, i64>(3)? as usize,
                    dimension: row.get::<_, i64>(4)? as usize,
                    built_at: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(info)
}

pub fn load_centroids(conn: &Connection, table: &str) -> Result<Vec<Centroid>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT list_id, centroid FROM {} ORDER BY list_id",
        centroids_table(table)
    ))?;
    let mut rows = stmt.query([])?;
    let mut centroids = Vec::new();
    while let Some(row) = rows.next()? {
        let blob: Vec<u8> = row.get(1)?;
        centroids.push(Centroid {
            list_id: row.get(0)?,
            vector: blob_to_embedding(&blob)?,
        });
    }
    Ok(centroids)
}

/// The `probes` lists whose centroids are closest to `query`, best first
pub fn nearest_lists(centroids: &[Centroid], query: &[f32], probes: usize) -> Result<Vec<i64>> {
    if let Some(first) = centroids.first() {
        if first.vector.len() != query.len() {
            return Err(RagsyncError::Validation(format!(
                "Query dimension {} does not match index dimension {}",
                query.len(),
                first.vector.len()
            )));
        }
    }

    let mut scored: Vec<(f32, i64)> = centroids
        .iter()
        .map(|c| (kmeans::dot(&c.vector, query), c.list_id))
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    Ok(scored.into_iter().take(probes).map(|(_, id)| id).collect())
}

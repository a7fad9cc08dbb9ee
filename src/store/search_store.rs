//! Query tier: a normalized copy of the chunk store, rebuilt wholesale.
//!
//! A rebuild writes into `search_store_shadow`, indexes it, and then swaps
//! it over `search_store` in one transaction. Readers keep seeing the old
//! complete table until the swap commits.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use rusqlite::{params_from_iter, Connection, ToSql};
use serde::Serialize;
use crate::db::Db;
use crate::error::{Result, RagsyncError};
use crate::index::{self, IndexParams};
use crate::sync::CancelFlag;
use super::chunk_store::{count_by_file_in, read_window};
use super::{
    embedding_to_blob, l2_normalize, record_table_ddl, validate_dimension, StoredChunk,
    SEARCH_TABLE, SHADOW_TABLE,
};

/// Chunk store rows read per window
pub const REBUILD_WINDOW: usize = 1000;

/// Rows per multi-row INSERT into the shadow table
pub const REBUILD_INSERT_BATCH: usize = 100;

/// Outcome of a completed rebuild
#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub rows: usize,
    /// Rows whose embedding was (near-)zero and copied unnormalized
    pub zero_vectors: usize,
    pub lists: usize,
    pub trained_lists: usize,
    pub elapsed: Duration,
}

/// Rebuild the search store from the chunk store with default index parameters
pub async fn rebuild(db: &Db, dim: usize, cancel: &CancelFlag) -> Result<RebuildReport> {
    rebuild_with(db, dim, IndexParams::default(), cancel).await
}

/// Rebuild the search store from the chunk store
///
/// An error or cancellation leaves `search_store` untouched; the partial
/// shadow table is discarded by the next rebuild.
pub async fn rebuild_with(
    db: &Db,
    dim: usize,
    params: IndexParams,
    cancel: &CancelFlag,
) -> Result<RebuildReport> {
    let cancel = cancel.clone();
    db.with_connection(move |conn| rebuild_blocking(conn, dim, &params, &cancel))
        .await
}

fn rebuild_blocking(
    conn: &mut Connection,
    dim: usize,
    params: &IndexParams,
    cancel: &CancelFlag,
) -> Result<RebuildReport> {
    let start = Instant::now();

    index::drop_index(conn, SHADOW_TABLE)?;
    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS {shadow};\n{ddl};",
        shadow = SHADOW_TABLE,
        ddl = record_table_ddl(SHADOW_TABLE, false)
    ))?;

    let mut rows = 0usize;
    let mut zero_vectors = 0usize;
    let mut after_id = 0i64;
    let mut window_number = 0usize;

    loop {
        cancel.check()?;

        let window = read_window(conn, after_id, REBUILD_WINDOW)?;
        let Some(last) = window.last() else {
            break;
        };
        after_id = last.id;
        window_number += 1;

        let mut normalized = Vec::with_capacity(window.len());
        for mut record in window {
            validate_dimension(&record.embedding, dim).map_err(|e| {
                RagsyncError::Rebuild(format!("chunk {} in {}: {}", record.id, record.filepath, e))
            })?;
            let (unit, zero) = l2_normalize(&record.embedding);
            if zero {
                zero_vectors += 1;
                log::warn!(
                    "Zero-norm embedding for chunk {} ({} #{}), copied unnormalized",
                    record.id,
                    record.filepath,
                    record.chunk_index
                );
            }
            record.embedding = unit;
            normalized.push(record);
        }

        let tx = conn.transaction()?;
        for batch in normalized.chunks(REBUILD_INSERT_BATCH) {
            insert_shadow_batch(&tx, batch)?;
        }
        tx.commit()?;

        rows += normalized.len();
        log::info!("Rebuild window {}: {} rows copied", window_number, rows);
    }

    cancel.check()?;
    let info = index::build_index(conn, SHADOW_TABLE, dim, params)?;

    let tx = conn.transaction()?;
    index::drop_index(&tx, SEARCH_TABLE)?;
    tx.execute_batch(&format!(
        "DROP TABLE IF EXISTS {live};\nALTER TABLE {shadow} RENAME TO {live};",
        live = SEARCH_TABLE,
        shadow = SHADOW_TABLE
    ))?;
    index::rename_index(&tx, SHADOW_TABLE, SEARCH_TABLE)?;
    tx.commit()?;

    let report = RebuildReport {
        rows,
        zero_vectors,
        lists: info.lists,
        trained_lists: info.trained_lists,
        elapsed: start.elapsed(),
    };
    log::info!(
        "Search store rebuilt: {} rows, {} zero vectors, {} lists in {:.2?}",
        report.rows,
        report.zero_vectors,
        report.lists,
        report.elapsed
    );
    Ok(report)
}

fn insert_shadow_batch(conn: &Connection, batch: &[StoredChunk]) -> Result<()> {
    let placeholders = vec!["(?, ?, ?, ?, ?, ?, ?, ?)"; batch.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} (id, chunk_text, embedding, filename, filepath, original_filepath, chunk_index, created_at) \
         VALUES {}",
        SHADOW_TABLE, placeholders
    );

    let mut values: Vec<Box<dyn ToSql>> = Vec::with_capacity(batch.len() * 8);
    for record in batch {
        values.push(Box::new(record.id));
        values.push(Box::new(record.chunk_text.clone()));
        values.push(Box::new(embedding_to_blob(&record.embedding)));
        values.push(Box::new(record.filename.clone()));
        values.push(Box::new(record.filepath.clone()));
        values.push(Box::new(record.original_filepath.clone()));
        values.push(Box::new(record.chunk_index));
        values.push(Box::new(record.created_at.clone()));
    }

    conn.execute(&sql, params_from_iter(values.iter()))?;
    Ok(())
}

/// Rows in the live search store
pub async fn count(db: &Db) -> Result<i64> {
    db.with_connection(|conn| {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", SEARCH_TABLE), [], |row| {
            row.get(0)
        })?;
        Ok(n)
    })
    .await
}

/// Row count per filepath in the live search store
pub async fn count_by_file(db: &Db) -> Result<BTreeMap<String, i64>> {
    db.with_connection(|conn| count_by_file_in(conn, SEARCH_TABLE)).await
}

//! Accumulation tier: append-only source of truth for chunk embeddings.
//!
//! Rows are only ever inserted or deleted; re-ingesting a changed file
//! deletes its rows and appends the new chunks in one transaction.

use std::collections::BTreeMap;
use rusqlite::{params, params_from_iter, Connection, ToSql, Transaction};
use crate::db::Db;
use crate::error::{Result, RagsyncError};
use super::{
    embedding_to_blob, record_table_ddl, stored_chunk_from_row, validate_dimension,
    FileIdentity, NewChunk, StoredChunk, CHUNK_TABLE, RECORD_COLUMNS,
};

/// Rows per multi-row INSERT statement
pub const APPEND_PAGE_SIZE: usize = 100;

const COLUMNS_PER_ROW: usize = 6;

/// Create the chunk store table if it is missing.
///
/// Same layout as `migrations/001_chunk_store.sql`, for callers that manage
/// their own database file.
pub async fn create_schema(db: &Db) -> Result<()> {
    db.with_connection(|conn| {
        conn.execute_batch(&format!(
            "{};\nCREATE INDEX IF NOT EXISTS idx_chunk_store_filepath ON {}(filepath);",
            record_table_ddl(CHUNK_TABLE, true),
            CHUNK_TABLE
        ))?;
        Ok(())
    })
    .await
}

/// Append a single chunk, returning its id
pub async fn append(db: &Db, dim: usize, chunk: NewChunk) -> Result<i64> {
    let ids = append_batch(db, dim, vec![chunk]).await?;
    ids.into_iter()
        .next()
        .ok_or_else(|| RagsyncError::Validation("append produced no id".to_string()))
}

/// Append chunks in one transaction
///
/// Every embedding is checked against `dim` before anything is written, so a
/// single bad vector rejects the whole batch. Rows go in as pages of
/// `APPEND_PAGE_SIZE` per INSERT statement.
///
/// # Returns
///
/// Assigned ids, in input order
pub async fn append_batch(db: &Db, dim: usize, chunks: Vec<NewChunk>) -> Result<Vec<i64>> {
    if chunks.is_empty() {
        return Ok(Vec::new());
    }
    for chunk in &chunks {
        validate_dimension(&chunk.embedding, dim)?;
    }

    db.with_connection(move |conn| {
        let tx = conn.transaction()?;
        let ids = insert_pages(&tx, &chunks)?;
        tx.commit()?;
        Ok(ids)
    })
    .await
}

/// Atomically replace every chunk of one file
///
/// Deletes the rows stored under `filepath` and appends `chunks` in the same
/// transaction. Readers never see the file half replaced.
///
/// # Returns
///
/// (deleted row count, new ids in input order)
pub async fn replace_file(
    db: &Db,
    dim: usize,
    filepath: &str,
    chunks: Vec<NewChunk>,
) -> Result<(usize, Vec<i64>)> {
    for chunk in &chunks {
        validate_dimension(&chunk.embedding, dim)?;
    }

    let filepath = filepath.to_string();
    db.with_connection(move |conn| {
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            &format!("DELETE FROM {} WHERE filepath = ?1", CHUNK_TABLE),
            params![filepath],
        )?;
        let ids = insert_pages(&tx, &chunks)?;
        tx.commit()?;
        Ok((deleted, ids))
    })
    .await
}

/// Distinct file identities present in the store, sorted
pub async fn list_known_files(db: &Db) -> Result<Vec<FileIdentity>> {
    db.with_connection(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT filename, filepath, original_filepath FROM {} \
             ORDER BY filepath, filename",
            CHUNK_TABLE
        ))?;
        let mut rows = stmt.query([])?;
        let mut files = Vec::new();
        while let Some(row) = rows.next()? {
            files.push(FileIdentity {
                filename: row.get(0)?,
                filepath: row.get(1)?,
                original_filepath: row.get(2)?,
            });
        }
        Ok(files)
    })
    .await
}

/// Delete all rows of one file, returning how many were removed
pub async fn delete_file(db: &Db, filepath: &str) -> Result<usize> {
    let filepath = filepath.to_string();
    db.with_connection(move |conn| {
        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE filepath = ?1", CHUNK_TABLE),
            params![filepath],
        )?;
        log::debug!("Deleted {} chunks for {}", deleted, filepath);
        Ok(deleted)
    })
    .await
}

/// Delete every row and restart id allocation
pub async fn clear(db: &Db) -> Result<usize> {
    db.with_connection(|conn| {
        let tx = conn.transaction()?;
        let deleted = tx.execute(&format!("DELETE FROM {}", CHUNK_TABLE), [])?;
        tx.execute("DELETE FROM sqlite_sequence WHERE name = ?1", params![CHUNK_TABLE])?;
        tx.commit()?;
        Ok(deleted)
    })
    .await
}

pub async fn count(db: &Db) -> Result<i64> {
    db.with_connection(|conn| {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", CHUNK_TABLE), [], |row| {
            row.get(0)
        })?;
        Ok(n)
    })
    .await
}

/// Row count per filepath
pub async fn count_by_file(db: &Db) -> Result<BTreeMap<String, i64>> {
    db.with_connection(|conn| count_by_file_in(conn, CHUNK_TABLE)).await
}

pub(crate) fn count_by_file_in(conn: &Connection, table: &str) -> Result<BTreeMap<String, i64>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT filepath, COUNT(*) FROM {} GROUP BY filepath",
        table
    ))?;
    let mut rows = stmt.query([])?;
    let mut counts = BTreeMap::new();
    while let Some(row) = rows.next()? {
        counts.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)?);
    }
    Ok(counts)
}

/// Keyset page of the store: up to `limit` rows with `id > after_id`, by id
pub fn read_window(conn: &Connection, after_id: i64, limit: usize) -> Result<Vec<StoredChunk>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM {} WHERE id > ?1 ORDER BY id LIMIT ?2",
        RECORD_COLUMNS, CHUNK_TABLE
    ))?;
    let mut rows = stmt.query(params![after_id, limit as i64])?;
    let mut window = Vec::with_capacity(limit);
    while let Some(row) = rows.next()? {
        window.push(stored_chunk_from_row(row)?);
    }
    Ok(window)
}

fn insert_pages(tx: &Transaction<'_>, chunks: &[NewChunk]) -> Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(chunks.len());

    for page in chunks.chunks(APPEND_PAGE_SIZE) {
        let placeholders = vec!["(?, ?, ?, ?, ?, ?)"; page.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} (chunk_text, embedding, filename, filepath, original_filepath, chunk_index) \
             VALUES {}",
            CHUNK_TABLE, placeholders
        );

        let mut values: Vec<Box<dyn ToSql>> = Vec::with_capacity(page.len() * COLUMNS_PER_ROW);
        for chunk in page {
            values.push(Box::new(chunk.chunk_text.clone()));
            values.push(Box::new(embedding_to_blob(&chunk.embedding)));
            values.push(Box::new(chunk.file.filename.clone()));
            values.push(Box::new(chunk.file.filepath.clone()));
            values.push(Box::new(chunk.file.original_filepath.clone()));
            values.push(Box::new(chunk.chunk_index));
        }

        tx.execute(&sql, params_from_iter(values.iter())).map_err(reject_duplicate)?;

        // AUTOINCREMENT hands out consecutive ids within one statement
        let last = tx.last_insert_rowid();
        let first = last - page.len() as i64 + 1;
        ids.extend(first..=last);
    }

    Ok(ids)
}

fn reject_duplicate(err: rusqlite::Error) -> RagsyncError {
    match err.sqlite_error_code() {
        Some(rusqlite::ErrorCode::ConstraintViolation) => RagsyncError::Validation(format!(
            "duplicate (filename, filepath, chunk_index): {}",
            err
        )),
        _ => RagsyncError::Database(err),
    }
}

//! Two-tier storage: the append-only chunk store and the rebuilt search store.
//!
//! Both tiers share one record layout. Embeddings are little-endian f32
//! BLOBs of exactly `dim` values; the search tier holds them L2-normalized.

pub mod codec;
pub mod chunk_store;
pub mod search_store;

use rusqlite::Row;
use serde::Serialize;
use crate::error::Result;

pub use codec::{
    blob_to_embedding, cosine_similarity, embedding_to_blob, l2_norm, l2_normalize, validate_dimension,
    NORM_EPSILON,
};
pub use chunk_store::APPEND_PAGE_SIZE;
pub use search_store::{rebuild, RebuildReport, REBUILD_INSERT_BATCH, REBUILD_WINDOW};

/// Accumulation tier table
pub const CHUNK_TABLE: &str = "chunk_store";
/// Query tier table
pub const SEARCH_TABLE: &str = "search_store";
/// Rebuild target, renamed over `search_store` once complete
pub const SHADOW_TABLE: &str = "search_store_shadow";

/// Column list shared by every record read, in `StoredChunk` field order
pub(crate) const RECORD_COLUMNS: &str =
    "id, chunk_text, embedding, filename, filepath, original_filepath, chunk_index, created_at";

/// Identity of the file a chunk came from
///
/// `original_filepath` is the pre-conversion source path, captured when the
/// file is ingested.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FileIdentity {
    pub filename: String,
    pub filepath: String,
    pub original_filepath: Option<String>,
}

/// A chunk waiting to be appended to the chunk store
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk_text: String,
    pub embedding: Vec<f32>,
    pub file: FileIdentity,
    /// 0-based position within the file, in document order
    pub chunk_index: i64,
}

/// A record read back from either tier
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredChunk {
    pub id: i64,
    pub chunk_text: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub filename: String,
    pub filepath: String,
    pub original_filepath: Option<String>,
    pub chunk_index: i64,
    pub created_at: String,
}

/// Map a row selected with `RECORD_COLUMNS`
pub(crate) fn stored_chunk_from_row(row: &Row<'_>) -> Result<StoredChunk> {
    let blob: Vec<u8> = row.get(2)?;
    Ok(StoredChunk {
        id: row.get(0)?,
        chunk_text: row.get(1)?,
        embedding: blob_to_embedding(&blob)?,
        filename: row.get(3)?,
        filepath: row.get(4)?,
        original_filepath: row.get(5)?,
        chunk_index: row.get(6)?,
        created_at: row.get(7)?,
    })
}

/// DDL for a record table.
///
/// The search tier keeps chunk ids, so only the chunk store allocates them.
/// Neither carries named indexes besides the chunk store's filepath index,
/// which lets the shadow table be renamed over the live one.
pub(crate) fn record_table_ddl(table: &str, allocate_ids: bool) -> String {
    let id_column = if allocate_ids {
        "id INTEGER PRIMARY KEY AUTOINCREMENT"
    } else {
        "id INTEGER PRIMARY KEY"
    };
    let unique = if allocate_ids {
        ",\n    UNIQUE (filename, filepath, chunk_index)"
    } else {
        ""
    };
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
    {id_column},
    chunk_text TEXT NOT NULL,
    embedding BLOB NOT NULL,
    filename TEXT NOT NULL,
    filepath TEXT NOT NULL,
    original_filepath TEXT,
    chunk_index INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP{unique}
)"
    )
}

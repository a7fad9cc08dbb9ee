//! Query engine over the search store.

pub mod session;
pub mod vector;

use std::collections::{BTreeMap, HashSet};
use rusqlite::{params, Connection};
use serde::Serialize;
use crate::cache::EmbeddingCache;
use crate::db::Db;
use crate::embeddings::Embedder;
use crate::error::Result;
use crate::store::{cosine_similarity, l2_normalize, stored_chunk_from_row, validate_dimension, StoredChunk, RECORD_COLUMNS, SEARCH_TABLE};

pub use session::{QuerySession, ScanSettings, SequentialScanGuard};
pub use vector::{default_probes, search_approx, search_exact};

/// Why a row is in a result list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// Matched the query directly
    Match,
    /// Neighbouring chunk of a match
    Context,
    /// Part of a matched file's full text
    FullDocument,
}

/// Search result structure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub id: i64,
    pub chunk_text: String,
    pub filename: String,
    pub filepath: String,
    pub original_filepath: Option<String>,
    pub chunk_index: i64,
    /// 1 - cosine distance to the query
    pub similarity: f32,
    pub kind: ResultKind,
}

impl SearchResult {
    pub(crate) fn from_record(record: StoredChunk, similarity: f32, kind: ResultKind) -> Self {
        Self {
            id: record.id,
            chunk_text: record.chunk_text,
            filename: record.filename,
            filepath: record.filepath,
            original_filepath: record.original_filepath,
            chunk_index: record.chunk_index,
            similarity,
            kind,
        }
    }
}

/// Options for a text query
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub threshold: f32,
    /// Compare against every row instead of probing the index
    pub exact: bool,
    /// Lists to probe; derived from the index when None
    pub probes: Option<usize>,
    /// Add `context_size` chunks either side of each match
    pub with_context: bool,
    pub context_size: usize,
    /// Add every chunk of each matched file
    pub full_document: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 5,
            threshold: 0.7,
            exact: false,
            probes: None,
            with_context: false,
            context_size: 1,
            full_document: false,
        }
    }
}

/// Embed `text` and search the store
///
/// Query embeddings are looked up in `cache` first when one is given.
/// Context and full-document expansion happen on the same connection as
/// the similarity search.
pub async fn search_text(
    db: &Db,
    embedder: &dyn Embedder,
    cache: Option<&EmbeddingCache>,
    text: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    let query = match cache.and_then(|c| c.get(text)) {
        Some(cached) => {
            log::debug!("Cache hit for query: {}", text);
            cached
        }
        None => {
            let embedding = embedder.embed_query(text).await?;
            if let Some(cache) = cache {
                cache.put(text.to_string(), embedding.clone());
            }
            embedding
        }
    };
    validate_dimension(&query, embedder.dimension())?;

    let options = options.clone();
    db.with_connection(move |conn| {
        let matches = if options.exact {
            vector::exact_in(conn, &query, options.limit, options.threshold)?
        } else {
            vector::approx_in(conn, &query, options.limit, options.threshold, options.probes)?
        };
        log::info!("Search returned {} matches", matches.len());

        let mut results = matches;
        if options.with_context && options.context_size > 0 {
            results = expand_with_context(conn, &query, results, options.context_size)?;
        }
        if options.full_document {
            results = expand_full_document(conn, &query, results)?;
        }
        Ok(results)
    })
    .await
}

/// Matches plus up to `context_size` neighbouring chunks per match
///
/// Output is de-duplicated by id and ordered by (filepath, chunk_index).
pub(crate) fn expand_with_context(
    conn: &Connection,
    query: &[f32],
    matches: Vec<SearchResult>,
    context_size: usize,
) -> Result<Vec<SearchResult>> {
    let unit = l2_normalize(query).0;
    let mut seen: HashSet<i64> = matches.iter().map(|r| r.id).collect();
    let mut visited = HashSet::new();
    let mut merged = matches.clone();

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} WHERE filepath = ?1 AND chunk_index BETWEEN ?2 AND ?3 ORDER BY chunk_index",
        RECORD_COLUMNS, SEARCH_TABLE
    ))?;
    for result in &matches {
        if !visited.insert((result.filepath.clone(), result.chunk_index)) {
            continue;
        }
        let reach = i64::try_from(context_size).unwrap_or(i64::MAX);
        let low = result.chunk_index.saturating_sub(reach).max(0);
        let high = result.chunk_index.saturating_add(reach);
        let mut rows = stmt.query(params![result.filepath, low, high])?;
        while let Some(row) = rows.next()? {
            let record = stored_chunk_from_row(row)?;
            if seen.insert(record.id) {
                let similarity = score(&unit, &record.embedding);
                merged.push(SearchResult::from_record(record, similarity, ResultKind::Context));
            }
        }
    }

    sort_by_position(&mut merged);
    Ok(merged)
}

/// Matches plus every chunk of each matched file, ordered by position
pub(crate) fn expand_full_document(
    conn: &Connection,
    query: &[f32],
    matches: Vec<SearchResult>,
) -> Result<Vec<SearchResult>> {
    let unit = l2_normalize(query).0;
    let mut seen: HashSet<i64> = matches.iter().map(|r| r.id).collect();
    let mut files = HashSet::new();
    let mut merged = matches.clone();

    for result in &matches {
        if !files.insert(result.filepath.clone()) {
            continue;
        }
        for record in file_records(conn, &result.filepath)? {
            if seen.insert(record.id) {
                let similarity = score(&unit, &record.embedding);
                merged.push(SearchResult::from_record(record, similarity, ResultKind::FullDocument));
            }
        }
    }

    sort_by_position(&mut merged);
    Ok(merged)
}

fn score(query: &[f32], embedding: &[f32]) -> f32 {
    if query.len() == embedding.len() {
        cosine_similarity(query, embedding)
    } else {
        0.0
    }
}

fn sort_by_position(results: &mut [SearchResult]) {
    results.sort_by(|a, b| a.filepath.cmp(&b.filepath).then(a.chunk_index.cmp(&b.chunk_index)));
}

fn file_records(conn: &Connection, filepath: &str) -> Result<Vec<StoredChunk>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM {} WHERE filepath = ?1 ORDER BY chunk_index",
        RECORD_COLUMNS, SEARCH_TABLE
    ))?;
    let mut rows = stmt.query(params![filepath])?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(stored_chunk_from_row(row)?);
    }
    Ok(records)
}

/// Every chunk of one file, in order
pub async fn full_document(db: &Db, filepath: &str) -> Result<Vec<StoredChunk>> {
    let filepath = filepath.to_string();
    db.with_connection(move |conn| file_records(conn, &filepath)).await
}

/// One search store record by id
pub async fn get_by_id(db: &Db, id: i64) -> Result<Option<StoredChunk>> {
    db.with_connection(move |conn| {
        let mut stmt = conn.prepare(&format!("SELECT {} FROM {} WHERE id = ?1", RECORD_COLUMNS, SEARCH_TABLE))?;
        let mut rows = stmt.query(params![id])?;
        let record = match rows.next()? {
            Some(row) => Some(stored_chunk_from_row(row)?),
            None => None,
        };
        Ok(record)
    })
    .await
}

/// Distinct source files with their chunk counts, keyed by filepath
pub async fn unique_sources(db: &Db) -> Result<BTreeMap<String, i64>> {
    crate::store::search_store::count_by_file(db).await
}

/// Rows in the search store
pub async fn count(db: &Db) -> Result<i64> {
    crate::store::search_store::count(db).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate;
    use crate::embeddings::HashingEmbedder;
    use crate::store::{chunk_store, rebuild, FileIdentity, NewChunk};
    use crate::sync::CancelFlag;
    use std::path::Path;
    use tempfile::TempDir;

    const DIM: usize = 64;

    async fn setup_indexed_db(files: &[(&str, &[&str])]) -> (Db, TempDir, HashingEmbedder) {
        let temp_dir = TempDir::new().unwrap();
        let db = Db::new(temp_dir.path().join("test.db"));
        let migrations_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        db.with_connection(move |conn| migrate::run_migrations(conn, &migrations_dir))
            .await
            .unwrap();

        let embedder = HashingEmbedder::new("hashing-v1", DIM);
        for (filepath, texts) in files {
            let chunks = texts
                .iter()
                .enumerate()
                .map(|(i, text)| NewChunk {
                    chunk_text: text.to_string(),
                    embedding: embedder.embed_text(text),
                    file: FileIdentity {
                        filename: filepath.to_string(),
                        filepath: filepath.to_string(),
                        original_filepath: None,
                    },
                    chunk_index: i as i64,
                })
                .collect();
            chunk_store::append_batch(&db, DIM, chunks).await.unwrap();
        }
        rebuild(&db, DIM, &CancelFlag::new()).await.unwrap();
        (db, temp_dir, embedder)
    }

    const GUIDE: &[&str] = &[
        "installing the toolchain with rustup",
        "writing your first cargo project",
        "ownership and borrowing rules explained",
        "lifetimes annotate how long references live",
        "async runtimes schedule futures on threads",
    ];
    const RECIPES: &[&str] = &["bake the bread for forty minutes", "whisk eggs with sugar until pale"];

    #[tokio::test]
    async fn test_exact_and_approx_agree_on_top_match() {
        let (db, _temp_dir, embedder) = setup_indexed_db(&[("guide.md", GUIDE), ("recipes.md", RECIPES)]).await;
        let query = embedder.embed_text("ownership and borrowing rules explained");

        let exact = search_exact(&db, DIM, &query, 3, 0.0).await.unwrap();
        let approx = search_approx(&db, DIM, &query, 3, 0.0, None).await.unwrap();

        assert_eq!(exact[0].chunk_text, "ownership and borrowing rules explained");
        assert!((exact[0].similarity - 1.0).abs() < 1e-4);
        assert_eq!(approx[0].id, exact[0].id);
        assert!(exact.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    }

    #[tokio::test]
    async fn test_unreachable_threshold_returns_empty() {
        let (db, _temp_dir, embedder) = setup_indexed_db(&[("guide.md", GUIDE)]).await;
        let query = embedder.embed_text(GUIDE[0]);
        assert!(search_exact(&db, DIM, &query, 5, 1.1).await.unwrap().is_empty());
        assert!(search_approx(&db, DIM, &query, 5, 1.1, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_query_dimension_rejected() {
        let (db, _temp_dir, _) = setup_indexed_db(&[("guide.md", GUIDE)]).await;
        let err = search_approx(&db, DIM, &[1.0, 0.0], 5, 0.0, None).await.unwrap_err();
        assert!(matches!(err, crate::error::RagsyncError::Validation(_)));
        let err = search_exact(&db, DIM, &[1.0, 0.0], 5, 0.0).await.unwrap_err();
        assert!(matches!(err, crate::error::RagsyncError::Validation(_)));
    }

    #[tokio::test]
    async fn test_limit_truncates() {
        let (db, _temp_dir, embedder) = setup_indexed_db(&[("guide.md", GUIDE), ("recipes.md", RECIPES)]).await;
        let query = embedder.embed_text("rust");
        let results = search_exact(&db, DIM, &query, 2, -1.0).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(search_exact(&db, DIM, &query, 0, -1.0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unbounded_limit_and_context() {
        let (db, _temp_dir, embedder) = setup_indexed_db(&[("guide.md", GUIDE), ("recipes.md", RECIPES)]).await;
        let query = embedder.embed_text("rust");

        let all = search_exact(&db, DIM, &query, usize::MAX, -1.0).await.unwrap();
        assert_eq!(all.len(), GUIDE.len() + RECIPES.len());
        let approx = search_approx(&db, DIM, &query, usize::MAX, -1.0, None).await.unwrap();
        assert!(approx.len() <= all.len());

        let options = SearchOptions {
            limit: 1,
            threshold: -1.0,
            exact: true,
            with_context: true,
            context_size: usize::MAX,
            ..SearchOptions::default()
        };
        let results = search_text(&db, &embedder, None, GUIDE[2], &options).await.unwrap();
        let guide_rows = results.iter().filter(|r| r.filepath == "guide.md").count();
        assert_eq!(guide_rows, GUIDE.len());
    }

    #[tokio::test]
    async fn test_search_text_with_context() {
        let (db, _temp_dir, embedder) = setup_indexed_db(&[("guide.md", GUIDE), ("recipes.md", RECIPES)]).await;
        let options = SearchOptions {
            limit: 1,
            threshold: 0.9,
            exact: true,
            with_context: true,
            context_size: 1,
            ..SearchOptions::default()
        };

        let results = search_text(&db, &embedder, None, GUIDE[2], &options).await.unwrap();
        let indexes: Vec<i64> = results.iter().map(|r| r.chunk_index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
        assert_eq!(results[1].kind, ResultKind::Match);
        assert_eq!(results[0].kind, ResultKind::Context);
        assert!(results.iter().all(|r| r.filepath == "guide.md"));
    }

    #[tokio::test]
    async fn test_search_text_full_document_and_cache() {
        let (db, _temp_dir, embedder) = setup_indexed_db(&[("guide.md", GUIDE), ("recipes.md", RECIPES)]).await;
        let cache = EmbeddingCache::new(8).unwrap();
        let options = SearchOptions {
            limit: 1,
            threshold: 0.9,
            exact: true,
            full_document: true,
            ..SearchOptions::default()
        };

        let results = search_text(&db, &embedder, Some(&cache), RECIPES[1], &options).await.unwrap();
        assert_eq!(results.len(), RECIPES.len());
        assert_eq!(results[1].kind, ResultKind::Match);
        assert_eq!(results[0].kind, ResultKind::FullDocument);

        search_text(&db, &embedder, Some(&cache), RECIPES[1], &options).await.unwrap();
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_lookup_helpers() {
        let (db, _temp_dir, _) = setup_indexed_db(&[("guide.md", GUIDE), ("recipes.md", RECIPES)]).await;

        assert_eq!(count(&db).await.unwrap(), 7);
        let sources = unique_sources(&db).await.unwrap();
        assert_eq!(sources.get("guide.md"), Some(&5));
        assert_eq!(sources.get("recipes.md"), Some(&2));

        let doc = full_document(&db, "recipes.md").await.unwrap();
        assert_eq!(doc.len(), 2);
        assert_eq!(doc[0].chunk_text, RECIPES[0]);

        let first = get_by_id(&db, doc[0].id).await.unwrap().unwrap();
        assert_eq!(first, doc[0]);
        assert!(get_by_id(&db, 9999).await.unwrap().is_none());
    }
}

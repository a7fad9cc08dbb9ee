use rusqlite::Connection;
use crate::db::Db;
use crate::error::Result;
use crate::index;
use crate::store::{l2_normalize, validate_dimension, SEARCH_TABLE};
use super::session::QuerySession;
use super::{ResultKind, SearchResult};

/// Tables above this size probe at least `LARGE_TABLE_MIN_PROBES` lists
pub const LARGE_TABLE_ROWS: usize = 100_000;
pub const LARGE_TABLE_MIN_PROBES: usize = 20;

/// Candidates fetched before threshold filtering: `max(limit * 3, MIN_CANDIDATES)`
pub const MIN_CANDIDATES: usize = 20;

/// Approximate nearest-neighbour search over the search store
///
/// # Arguments
///
/// * `db` - Database connection wrapper
/// * `dim` - Store dimension; the query must match it
/// * `query` - Query embedding, normalized here
/// * `limit` - Maximum number of results
/// * `threshold` - Minimum similarity (1 - cosine distance)
/// * `probes` - Lists to scan; derived from the index when None
///
/// # Returns
///
/// Results by similarity descending; empty when nothing reaches `threshold`
pub async fn search_approx(
    db: &Db,
    dim: usize,
    query: &[f32],
    limit: usize,
    threshold: f32,
    probes: Option<usize>,
) -> Result<Vec<SearchResult>> {
    validate_dimension(query, dim)?;
    let query = query.to_vec();
    db.with_connection(move |conn| approx_in(conn, &query, limit, threshold, probes))
        .await
}

/// Exact search: the same pipeline with index scans disabled
///
/// Every row is compared, so the result is the true top-`limit`.
pub async fn search_exact(
    db: &Db,
    dim: usize,
    query: &[f32],
    limit: usize,
    threshold: f32,
) -> Result<Vec<SearchResult>> {
    validate_dimension(query, dim)?;
    let query = query.to_vec();
    db.with_connection(move |conn| exact_in(conn, &query, limit, threshold))
        .await
}

/// `floor(sqrt(lists))`, raised for large tables
pub fn default_probes(lists: usize, rows: usize) -> usize {
    let probes = ((lists as f64).sqrt().floor() as usize).max(1);
    if rows > LARGE_TABLE_ROWS {
        probes.max(LARGE_TABLE_MIN_PROBES)
    } else {
        probes
    }
}

pub(crate) fn approx_in(
    conn: &Connection,
    query: &[f32],
    limit: usize,
    threshold: f32,
    probes: Option<usize>,
) -> Result<Vec<SearchResult>> {
    let query = normalized_query(query);
    let mut session = QuerySession::new(conn);

    let probes = match probes {
        Some(p) => Some(p),
        None => index::index_info(conn, SEARCH_TABLE)?.map(|info| {
            let p = default_probes(info.lists, info.row_count);
            log::debug!("{} lists, {} rows: probes = {}", info.lists, info.row_count, p);
            p
        }),
    };
    if let Some(p) = probes {
        session.set_probes(p);
    }

    run(&session, &query, limit, threshold)
}

pub(crate) fn exact_in(conn: &Connection, query: &[f32], limit: usize, threshold: f32) -> Result<Vec<SearchResult>> {
    let query = normalized_query(query);
    let mut session = QuerySession::new(conn);
    let guard = session.sequential_scan();
    run(&guard, &query, limit, threshold)
}

fn normalized_query(query: &[f32]) -> Vec<f32> {
    let (unit, zero) = l2_normalize(query);
    if zero {
        log::warn!("Query embedding has zero norm; every similarity will be 0");
    }
    unit
}

fn run(session: &QuerySession<'_>, query: &[f32], limit: usize, threshold: f32) -> Result<Vec<SearchResult>> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let fetch = limit.saturating_mul(3).max(MIN_CANDIDATES);
    let candidates = session.nearest(SEARCH_TABLE, query, fetch, threshold)?;

    Ok(candidates
        .into_iter()
        .filter(|(similarity, _)| *similarity >= threshold)
        .take(limit)
        .map(|(similarity, record)| SearchResult::from_record(record, similarity, ResultKind::Match))
        .collect())
}

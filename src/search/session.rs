//! Per-connection scan settings and the candidate scan they drive.

use std::ops::{Deref, DerefMut};
use rusqlite::{params_from_iter, Connection};
use crate::error::Result;
use crate::index::{self, IndexInfo};
use crate::store::{blob_to_embedding, cosine_similarity, stored_chunk_from_row, StoredChunk, RECORD_COLUMNS};

/// Lists probed when nothing set `probes`
const DEFAULT_PROBES: usize = 1;

/// Query-time knobs of the ANN index, scoped to one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
    /// Inverted lists scanned per query; None means `DEFAULT_PROBES`
    pub probes: Option<usize>,
    /// When false every query scans the whole table
    pub enable_index_scan: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            probes: None,
            enable_index_scan: true,
        }
    }
}

/// A read-only connection plus its scan settings
pub struct QuerySession<'c> {
    conn: &'c Connection,
    settings: ScanSettings,
}

impl<'c> QuerySession<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            settings: ScanSettings::default(),
        }
    }

    pub fn conn(&self) -> &'c Connection {
        self.conn
    }

    pub fn settings(&self) -> ScanSettings {
        self.settings
    }

    pub fn set_probes(&mut self, probes: usize) {
        log::debug!("session probes = {}", probes);
        self.settings.probes = Some(probes.max(1));
    }

    pub fn set_index_scan(&mut self, enabled: bool) {
        log::debug!("session enable_index_scan = {}", enabled);
        self.settings.enable_index_scan = enabled;
    }

    /// Disable index scans until the returned guard is dropped
    pub fn sequential_scan(&mut self) -> SequentialScanGuard<'_, 'c> {
        let previous = self.settings.enable_index_scan;
        self.set_index_scan(false);
        SequentialScanGuard {
            session: self,
            previous,
        }
    }

    /// Up to `fetch` rows of `table` with similarity >= `threshold`, best first.
    ///
    /// Uses the table's inverted lists when an index exists and index scans
    /// are enabled; otherwise scans every row.
    pub fn nearest(
        &self,
        table: &str,
        query: &[f32],
        fetch: usize,
        threshold: f32,
    ) -> Result<Vec<(f32, StoredChunk)>> {
        let index = if self.settings.enable_index_scan {
            let info = index::index_info(self.conn, table)?;
            if info.is_none() {
                log::info!("No index on {}, falling back to sequential scan", table);
            }
            info
        } else {
            None
        };

        let scored = match index {
            Some(info) if info.trained_lists > 0 => self.scan_lists(table, &info, query, threshold)?,
            _ => self.scan_table(table, query, threshold)?,
        };

        self.fetch_records(table, top_n(scored, fetch))
    }

    fn scan_lists(&self, table: &str, info: &IndexInfo, query: &[f32], threshold: f32) -> Result<Vec<(f32, i64)>> {
        let probes = self.settings.probes.unwrap_or(DEFAULT_PROBES);
        let centroids = index::load_centroids(self.conn, table)?;
        let lists = index::nearest_lists(&centroids, query, probes)?;
        log::debug!(
            "Index scan on {}: probing {} of {} lists",
            info.index_name,
            lists.len(),
            info.trained_lists
        );

        let placeholders = vec!["?"; lists.len()].join(", ");
        let sql = format!(
            "SELECT t.id, t.embedding FROM {lists_table} l JOIN {table} t ON t.id = l.row_id \
             WHERE l.list_id IN ({placeholders})",
            lists_table = index::lists_table(table),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(lists.iter()))?;
        score_rows(&mut rows, query, threshold)
    }

    fn scan_table(&self, table: &str, query: &[f32], threshold: f32) -> Result<Vec<(f32, i64)>> {
        log::debug!("Sequential scan on {}", table);
        let mut stmt = self.conn.prepare(&format!("SELECT id, embedding FROM {}", table))?;
        let mut rows = stmt.query([])?;
        score_rows(&mut rows, query, threshold)
    }

    fn fetch_records(&self, table: &str, top: Vec<(f32, i64)>) -> Result<Vec<(f32, StoredChunk)>> {
        if top.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; top.len()].join(", ");
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM {} WHERE id IN ({})",
            RECORD_COLUMNS, table, placeholders
        ))?;
        let mut rows = stmt.query(params_from_iter(top.iter().map(|(_, id)| id)))?;
        let mut by_id = std::collections::HashMap::with_capacity(top.len());
        while let Some(row) = rows.next()? {
            let record = stored_chunk_from_row(row)?;
            by_id.insert(record.id, record);
        }

        Ok(top
            .into_iter()
            .filter_map(|(similarity, id)| by_id.remove(&id).map(|record| (similarity, record)))
            .collect())
    }
}

/// Restores the session's index-scan setting when dropped
pub struct SequentialScanGuard<'s, 'c> {
    session: &'s mut QuerySession<'c>,
    previous: bool,
}

impl<'s, 'c> Deref for SequentialScanGuard<'s, 'c> {
    type Target = QuerySession<'c>;

    fn deref(&self) -> &Self::Target {
        &*self.session
    }
}

impl<'s, 'c> DerefMut for SequentialScanGuard<'s, 'c> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.session
    }
}

impl Drop for SequentialScanGuard<'_, '_> {
    fn drop(&mut self) {
        self.session.set_index_scan(self.previous);
    }
}

fn score_rows(rows: &mut rusqlite::Rows<'_>, query: &[f32], threshold: f32) -> Result<Vec<(f32, i64)>> {
    let mut scored = Vec::new();
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        let blob: Vec<u8> = row.get(1)?;
        let embedding = blob_to_embedding(&blob)?;
        if embedding.len() != query.len() {
            log::warn!("Skipping row {} with dimension {}", id, embedding.len());
            continue;
        }
        let similarity = cosine_similarity(query, &embedding);
        if similarity >= threshold {
            scored.push((similarity, id));
        }
    }
    Ok(scored)
}

/// Best `n` by similarity, ties broken by id
fn top_n(mut scored: Vec<(f32, i64)>, n: usize) -> Vec<(f32, i64)> {
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    scored.truncate(n);
    scored
}

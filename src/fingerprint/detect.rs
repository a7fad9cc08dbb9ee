//! Change detection: which source files need (re)processing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use futures_util::stream::{self, StreamExt};
use walkdir::WalkDir;
use crate::error::{Result, RagsyncError};
use super::{compute_fingerprint, FileFingerprint, FingerprintRegistry};

/// A file selected for processing, with the fingerprint it has now.
///
/// The fingerprint is recorded in the registry only after the file's
/// chunks have been committed.
#[derive(Debug, Clone)]
pub struct DetectedFile {
    pub path: PathBuf,
    pub fingerprint: FileFingerprint,
    /// True when the registry had no entry for this path
    pub is_new: bool,
}

impl DetectedFile {
    pub fn key(&self) -> String {
        self.path.to_string_lossy().to_string()
    }
}

/// Result of comparing a source tree against the registry
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// New or changed files, sorted by path
    pub to_process: Vec<DetectedFile>,
    pub unchanged: Vec<PathBuf>,
    /// Registry paths under the root that are gone from disk, in either mode
    pub deleted: Vec<String>,
    /// Files that matched but could not be fingerprinted
    pub skipped: usize,
}

impl ChangeSet {
    pub fn discovered(&self) -> usize {
        self.to_process.len() + self.unchanged.len() + self.skipped
    }
}

/// Compare the files under `root` with `registry`
///
/// # Arguments
///
/// * `root` - Source directory, walked recursively
/// * `extensions` - Lower-case extensions to keep, without the dot
/// * `registry` - Fingerprints from the previous run
/// * `incremental` - When false every matching file is selected
/// * `workers` - Files fingerprinted concurrently
pub async fn detect_changes(
    root: &Path,
    extensions: &[String],
    registry: &FingerprintRegistry,
    incremental: bool,
    workers: usize,
) -> Result<ChangeSet> {
    if !root.is_dir() {
        return Err(RagsyncError::Validation(format!(
            "Source directory {} does not exist or is not a directory",
            root.display()
        )));
    }

    let root = root.canonicalize()?;
    let extensions: Vec<String> = extensions.iter().map(|e| e.trim_start_matches('.').to_lowercase()).collect();
    let walk_root = root.clone();
    let files = tokio::task::spawn_blocking(move || discover(&walk_root, &extensions))
        .await
        .map_err(|e| RagsyncError::Connectivity(format!("file discovery task failed: {}", e)))?;
    log::info!("Discovered {} files in {}", files.len(), root.display());

    let fingerprints: Vec<(PathBuf, Result<FileFingerprint>)> = stream::iter(files.iter().cloned())
        .map(|path| async move {
            let target = path.clone();
            let fingerprint = tokio::task::spawn_blocking(move || compute_fingerprint(&target))
                .await
                .unwrap_or_else(|e| Err(RagsyncError::Connectivity(format!("fingerprint task failed: {}", e))));
            (path, fingerprint)
        })
        .buffer_unordered(workers.max(1))
        .collect()
        .await;

    let mut changes = ChangeSet::default();
    for (path, fingerprint) in fingerprints {
        let fingerprint = match fingerprint {
            Ok(fp) => fp,
            Err(e) => {
                log::warn!("Skipping {}: {}", path.display(), e);
                changes.skipped += 1;
                continue;
            }
        };

        let key = path.to_string_lossy().to_string();
        let previous = registry.get(&key);
        let changed = !incremental || previous != Some(&fingerprint);
        if changed {
            changes.to_process.push(DetectedFile {
                path,
                fingerprint,
                is_new: previous.is_none(),
            });
        } else {
            changes.unchanged.push(path);
        }
    }

    let present: HashSet<String> = files.iter().map(|p| p.to_string_lossy().to_string()).collect();
    changes.deleted = registry
        .paths()
        .filter(|p| Path::new(p).starts_with(&root) && !present.contains(*p))
        .map(str::to_string)
        .collect();

    changes.to_process.sort_by(|a, b| a.path.cmp(&b.path));
    changes.unchanged.sort();
    changes.deleted.sort();

    log::info!(
        "Files to process: {} / {} ({} unchanged, {} deleted, {} skipped)",
        changes.to_process.len(),
        changes.discovered(),
        changes.unchanged.len(),
        changes.deleted.len(),
        changes.skipped
    );
    Ok(changes)
}

fn discover(root: &Path, extensions: &[String]) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| match e {
            Ok(entry) => Some(entry),
            Err(err) => {
                log::warn!("Cannot walk entry: {}", err);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|ext| extensions.iter().any(|e| e == &ext.to_lowercase()))
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect()
}

//! File fingerprints and the on-disk registry used for incremental runs.
//!
//! The registry lives at `<processed_dir>/file_registry.json` and maps each
//! source file's absolute path to the fingerprint it had when its chunks
//! were last committed.

pub mod detect;

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use crate::error::{Result, RagsyncError};

pub use detect::{detect_changes, ChangeSet, DetectedFile};

pub const REGISTRY_FILE: &str = "file_registry.json";

/// (content hash, size, modification time) of a source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// SHA-256 of the content, lower-case hex
    pub hash: String,
    pub size: u64,
    /// Nanoseconds since the Unix epoch
    pub modified_ns: i64,
}

/// Fingerprint a file from its content and metadata
pub fn compute_fingerprint(path: &Path) -> Result<FileFingerprint> {
    let metadata = fs::metadata(path)?;
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    let modified_ns = match metadata.modified()?.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_nanos() as i64,
        Err(before) => -(before.duration().as_nanos() as i64),
    };

    Ok(FileFingerprint {
        hash: format!("{:x}", hasher.finalize()),
        size: metadata.len(),
        modified_ns,
    })
}

/// Path string -> last committed fingerprint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FingerprintRegistry {
    entries: BTreeMap<String, FileFingerprint>,
}

impl FingerprintRegistry {
    pub fn registry_path(processed_dir: &Path) -> PathBuf {
        processed_dir.join(REGISTRY_FILE)
    }

    /// Load the registry of `processed_dir`
    ///
    /// A missing file is an empty registry; an unparsable one is a
    /// validation error rather than a silent reset.
    pub fn load(processed_dir: &Path) -> Result<Self> {
        let path = Self::registry_path(processed_dir);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No registry at {}, starting empty", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let registry: Self = serde_json::from_str(&content).map_err(|e| {
            RagsyncError::Validation(format!("Malformed registry {}: {}", path.display(), e))
        })?;
        log::info!("Loaded {} fingerprints from {}", registry.len(), path.display());
        Ok(registry)
    }

    /// Write the registry atomically: temp file in the same directory, then rename
    pub fn save(&self, processed_dir: &Path) -> Result<()> {
        fs::create_dir_all(processed_dir)?;
        let path = Self::registry_path(processed_dir);
        let tmp = processed_dir.join(format!("{}.tmp", REGISTRY_FILE));

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| RagsyncError::Validation(format!("Cannot serialize registry: {}", e)))?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;

        log::info!("Saved {} fingerprints to {}", self.len(), path.display());
        Ok(())
    }

    pub fn record(&mut self, path: impl Into<String>, fingerprint: FileFingerprint) {
        self.entries.insert(path.into(), fingerprint);
    }

    pub fn remove(&mut self, path: &str) -> Option<FileFingerprint> {
        self.entries.remove(path)
    }

    pub fn get(&self, path: &str) -> Option<&FileFingerprint> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

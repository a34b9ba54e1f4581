//! Durable, content-addressed asset cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/records/<sha256(source reference)>.json   one record per reference
//! <root>/files/<hash16>.<ext>                      stored bytes, shared by
//!                                                  every reference whose bytes
//!                                                  hash identically
//! ```
//!
//! A record is only valid while its backing file exists. Validity is checked
//! on every read; nothing sweeps in the background. [`AssetCache::cleanup`]
//! is the explicit pruning pass.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::output::write_atomic;

const RECORDS_DIR: &str = "records";
const FILES_DIR: &str = "files";
const HASH_PREFIX_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetCacheEntry {
    pub source_reference: String,
    /// Sanitized base filename inside the cache's files directory.
    pub local_filename: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Metadata supplied with [`AssetCache::set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetMeta {
    pub content_hash: String,
}

/// Result of placing bytes into the files directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub filename: String,
    pub content_hash: String,
    /// `false` when identical bytes were already stored.
    pub newly_written: bool,
}

pub struct AssetCache {
    records_dir: PathBuf,
    files_dir: PathBuf,
    index: Mutex<HashMap<String, AssetCacheEntry>>,
}

impl AssetCache {
    /// Opens (creating if needed) the cache rooted at `root`.
    ///
    /// Unreadable or malformed records are skipped: a damaged record costs a
    /// re-download, never the run.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        let root = root.as_ref();
        let records_dir = root.join(RECORDS_DIR);
        let files_dir = root.join(FILES_DIR);
        fs::create_dir_all(&records_dir).map_err(|e| CacheError::io(&records_dir, e))?;
        fs::create_dir_all(&files_dir).map_err(|e| CacheError::io(&files_dir, e))?;

        let mut index = HashMap::new();
        let entries = fs::read_dir(&records_dir).map_err(|e| CacheError::io(&records_dir, e))?;
        for dir_entry in entries.flatten() {
            let path = dir_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path) {
                Ok(record) => {
                    index.insert(record.source_reference.clone(), record);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "[CACHE] Skipping unreadable asset record"),
            }
        }
        info!(root = %root.display(), entries = index.len(), "[CACHE] Asset cache opened");

        Ok(Self {
            records_dir,
            files_dir,
            index: Mutex::new(index),
        })
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    pub fn file_path(&self, entry: &AssetCacheEntry) -> PathBuf {
        self.files_dir.join(&entry.local_filename)
    }

    /// `true` only if a record exists and its backing file is on disk.
    pub fn has(&self, reference: &str) -> bool {
        self.get(reference).is_some()
    }

    /// Returns the entry for `reference` if it is valid right now.
    pub fn get(&self, reference: &str) -> Option<AssetCacheEntry> {
        let entry = self.lock().get(reference).cloned()?;
        if self.file_path(&entry).is_file() {
            Some(entry)
        } else {
            debug!(reference, filename = %entry.local_filename, "[CACHE] Record present but file missing");
            None
        }
    }

    /// Records `reference → local_path`. Only the sanitized base filename of
    /// `local_path` is kept. The record is persisted before returning.
    pub fn set(
        &self,
        reference: &str,
        local_path: &Path,
        meta: AssetMeta,
    ) -> Result<AssetCacheEntry, CacheError> {
        let raw_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let entry = AssetCacheEntry {
            source_reference: reference.to_string(),
            local_filename: sanitize_filename(&raw_name),
            content_hash: meta.content_hash,
            created_at: Utc::now(),
        };

        let record_path = self.record_path(reference);
        let json = serde_json::to_vec_pretty(&entry).map_err(|source| CacheError::Malformed {
            path: record_path.clone(),
            source,
        })?;
        write_atomic(&record_path, &json).map_err(|e| CacheError::io(&record_path, e))?;

        self.lock().insert(reference.to_string(), entry.clone());
        debug!(reference, filename = %entry.local_filename, "[CACHE] Asset recorded");
        Ok(entry)
    }

    /// Writes `bytes` under their content hash, skipping the write when the
    /// same bytes are already stored.
    pub fn store_bytes(&self, bytes: &[u8], extension: &str) -> Result<StoredFile, CacheError> {
        let content_hash = content_hash(bytes);
        let filename = sanitize_filename(&format!(
            "{}.{}",
            &content_hash[..HASH_PREFIX_LEN],
            extension
        ));
        let path = self.files_dir.join(&filename);
        let newly_written = if path.is_file() {
            false
        } else {
            write_atomic(&path, bytes).map_err(|e| CacheError::io(&path, e))?;
            true
        };
        Ok(StoredFile {
            path,
            filename,
            content_hash,
            newly_written,
        })
    }

    /// Drops every record whose backing file is missing. Returns how many were removed.
    pub fn cleanup(&self) -> Result<usize, CacheError> {
        let stale: Vec<String> = self
            .lock()
            .values()
            .filter(|entry| !self.file_path(entry).is_file())
            .map(|entry| entry.source_reference.clone())
            .collect();

        for reference in &stale {
            let record_path = self.record_path(reference);
            match fs::remove_file(&record_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(&record_path, e)),
            }
            self.lock().remove(reference);
        }

        info!(removed = stale.len(), "[CACHE] Asset cache cleanup complete");
        Ok(stale.len())
    }

    /// Number of records, valid or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record_path(&self, reference: &str) -> PathBuf {
        self.records_dir
            .join(format!("{}.json", content_hash(reference.as_bytes())))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AssetCacheEntry>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_record(path: &Path) -> Result<AssetCacheEntry, CacheError> {
    let bytes = fs::read(path).map_err(|e| CacheError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|source| CacheError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Lowercase hex SHA-256.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Reduces an untrusted name to a safe base filename.
///
/// Directory components are dropped, anything outside `[A-Za-z0-9._-]`
/// becomes `_`, and leading dots are stripped so the result can never be
/// `.`/`..` or a hidden file.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "asset".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_directories_and_odd_characters() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("..\\..\\boot.ini"), "boot.ini");
        assert_eq!(sanitize_filename("my image (1).png"), "my_image__1_.png");
        assert_eq!(sanitize_filename(".."), "asset");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename(""), "asset");
    }

    #[test]
    fn content_hash_is_stable_hex() {
        let hash = content_hash(b"abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}

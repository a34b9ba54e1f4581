//! Incremental-sync ledger.
//!
//! One JSON document per cache directory:
//!
//! ```json
//! { "version": 1, "pipelineFingerprint": "…", "lastSync": "…",
//!   "pages": { "<id>": { "lastEdited": "…", "outputPaths": ["…"],
//!                        "processedAt": "…", "containsForbiddenRefs": false,
//!                        "needsRetry": false } } }
//! ```
//!
//! Records only ever grow through [`SyncLedger::update_item`]: the output
//! path set is unioned and the newer modification stamp wins, so a stale
//! late write cannot regress a fresher record.
//!
//! Items that fail go through [`SyncLedger::record_failure`] instead. Their
//! output paths are still tracked so deletion can clean them up, but the
//! stamp does not advance and the record is flagged for the next run.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::contract::SourceItem;
use crate::error::CacheError;
use crate::output::write_atomic;

pub const LEDGER_VERSION: u32 = 1;
pub const LEDGER_FILE: &str = "sync-ledger.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRecord {
    pub last_edited: DateTime<Utc>,
    #[serde(default)]
    pub output_paths: BTreeSet<PathBuf>,
    pub processed_at: DateTime<Utc>,
    #[serde(default)]
    pub contains_forbidden_refs: bool,
    /// Processing failed or left unresolved assets; retried next run.
    #[serde(default)]
    pub needs_retry: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLedger {
    pub version: u32,
    pub pipeline_fingerprint: String,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pages: BTreeMap<String, ItemRecord>,
}

impl SyncLedger {
    pub fn new(pipeline_fingerprint: impl Into<String>) -> Self {
        Self {
            version: LEDGER_VERSION,
            pipeline_fingerprint: pipeline_fingerprint.into(),
            last_sync: None,
            pages: BTreeMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let bytes = fs::read(path).map_err(|e| CacheError::io(path, e))?;
        serde_json::from_slice(&bytes).map_err(|source| CacheError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Atomically replaces the ledger on disk.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let json = serde_json::to_vec_pretty(self).map_err(|source| CacheError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
        write_atomic(path, &json).map_err(|e| CacheError::io(path, e))?;
        debug!(path = %path.display(), items = self.pages.len(), "[CACHE] Sync ledger saved");
        Ok(())
    }

    pub fn record(&self, id: &str) -> Option<&ItemRecord> {
        self.pages.get(id)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Merges a processing result into the ledger.
    pub fn update_item(
        &mut self,
        id: &str,
        last_edited: DateTime<Utc>,
        output_paths: impl IntoIterator<Item = PathBuf>,
        contains_forbidden_refs: bool,
    ) {
        let now = Utc::now();
        match self.pages.get_mut(id) {
            Some(record) => {
                record.output_paths.extend(output_paths);
                if last_edited >= record.last_edited {
                    record.last_edited = last_edited;
                    record.contains_forbidden_refs = contains_forbidden_refs;
                    record.needs_retry = false;
                } else {
                    debug!(id, "[CACHE] Ignoring stale modification stamp on update");
                }
                record.processed_at = record.processed_at.max(now);
            }
            None => {
                self.pages.insert(
                    id.to_string(),
                    ItemRecord {
                        last_edited,
                        output_paths: output_paths.into_iter().collect(),
                        processed_at: now,
                        contains_forbidden_refs,
                        needs_retry: false,
                    },
                );
            }
        }
    }

    /// Records a terminal failure. Paths are unioned so deletion still finds
    /// them; the stamp is left where it was (a new record is stamped at the
    /// epoch) and the record is flagged for retry.
    pub fn record_failure(&mut self, id: &str, output_paths: impl IntoIterator<Item = PathBuf>) {
        let now = Utc::now();
        let record = self.pages.entry(id.to_string()).or_insert_with(|| ItemRecord {
            last_edited: DateTime::<Utc>::UNIX_EPOCH,
            output_paths: BTreeSet::new(),
            processed_at: now,
            contains_forbidden_refs: false,
            needs_retry: true,
        });
        record.output_paths.extend(output_paths);
        record.processed_at = record.processed_at.max(now);
        record.needs_retry = true;
    }

    /// Flags an existing record for reprocessing on the next run.
    pub fn flag_for_retry(&mut self, id: &str) {
        if let Some(record) = self.pages.get_mut(id) {
            record.needs_retry = true;
        }
    }

    pub fn remove_item(&mut self, id: &str) -> Option<ItemRecord> {
        self.pages.remove(id)
    }

    pub fn mark_synced(&mut self) {
        self.last_sync = Some(Utc::now());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncReason {
    Forced,
    MissingCache,
    MalformedCache,
    VersionMismatch { found: u32, expected: u32 },
    FingerprintChanged,
    Incremental,
}

impl fmt::Display for SyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncReason::Forced => write!(f, "full rebuild forced"),
            SyncReason::MissingCache => write!(f, "no sync cache found"),
            SyncReason::MalformedCache => write!(f, "sync cache unreadable"),
            SyncReason::VersionMismatch { found, expected } => {
                write!(f, "sync cache version {found} does not match {expected}")
            }
            SyncReason::FingerprintChanged => write!(f, "pipeline fingerprint changed"),
            SyncReason::Incremental => write!(f, "incremental"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncMode {
    pub full_rebuild: bool,
    pub reason: SyncReason,
    /// Ledger to work against. On a forced or fingerprint-triggered rebuild
    /// the previous records are carried over so deletions are still detected.
    pub cache: SyncLedger,
}

/// Decides between a full rebuild and an incremental run. Never fails: an
/// unreadable ledger is discarded and the run starts from an empty one.
pub fn determine_sync_mode(ledger_path: &Path, pipeline_fingerprint: &str, force: bool) -> SyncMode {
    let loaded = match SyncLedger::load(ledger_path) {
        Ok(ledger) => Ok(ledger),
        Err(CacheError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            Err(SyncReason::MissingCache)
        }
        Err(e) => {
            warn!(path = %ledger_path.display(), error = %e, "[CACHE] Discarding unreadable sync cache");
            Err(SyncReason::MalformedCache)
        }
    };

    let mode = match loaded {
        Err(reason) => SyncMode {
            full_rebuild: true,
            reason: if force { SyncReason::Forced } else { reason },
            cache: SyncLedger::new(pipeline_fingerprint),
        },
        Ok(ledger) if ledger.version != LEDGER_VERSION => SyncMode {
            full_rebuild: true,
            reason: if force {
                SyncReason::Forced
            } else {
                SyncReason::VersionMismatch {
                    found: ledger.version,
                    expected: LEDGER_VERSION,
                }
            },
            cache: SyncLedger::new(pipeline_fingerprint),
        },
        Ok(mut ledger) => {
            let reason = if force {
                SyncReason::Forced
            } else if ledger.pipeline_fingerprint != pipeline_fingerprint {
                SyncReason::FingerprintChanged
            } else {
                SyncReason::Incremental
            };
            ledger.pipeline_fingerprint = pipeline_fingerprint.to_string();
            SyncMode {
                full_rebuild: reason != SyncReason::Incremental,
                reason,
                cache: ledger,
            }
        }
    };

    info!(
        full_rebuild = mode.full_rebuild,
        reason = %mode.reason,
        cached_items = mode.cache.len(),
        "[CACHE] Sync mode determined"
    );
    mode
}

/// Why an item needs processing, or `None` when it can be skipped.
pub fn change_reason(item: &SourceItem, ledger: &SyncLedger) -> Option<&'static str> {
    let Some(record) = ledger.record(&item.id) else {
        return Some("new");
    };
    if item.last_modified > record.last_edited {
        return Some("modified");
    }
    if record.output_paths.is_empty() || record.output_paths.iter().any(|p| !p.is_file()) {
        return Some("output missing");
    }
    if record.contains_forbidden_refs {
        return Some("previously broken");
    }
    if record.needs_retry {
        return Some("retry pending");
    }
    None
}

/// Items that are new, modified, missing an output on disk, still broken,
/// or flagged for retry.
pub fn filter_changed_items(items: &[SourceItem], ledger: &SyncLedger) -> Vec<SourceItem> {
    items
        .iter()
        .filter(|item| match change_reason(item, ledger) {
            Some(reason) => {
                debug!(id = %item.id, reason, "[CACHE] Item needs processing");
                true
            }
            None => false,
        })
        .cloned()
        .collect()
}

/// Ids recorded in the ledger but absent from `current_ids`. An empty
/// listing yields no deletions.
pub fn find_deleted_items<'a, I>(current_ids: I, ledger: &SyncLedger) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let current: HashSet<&str> = current_ids.into_iter().collect();
    if current.is_empty() {
        if !ledger.is_empty() {
            warn!(
                cached_items = ledger.len(),
                "[CACHE] Empty source listing, skipping deletion detection"
            );
        }
        return Vec::new();
    }
    ledger
        .pages
        .keys()
        .filter(|id| !current.contains(id.as_str()))
        .cloned()
        .collect()
}

//! Bounded JSON-lines failure log for offline recovery.
//!
//! Every method is best effort: a failure to write the log is reported
//! through tracing and otherwise ignored.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AssetError;
use crate::output::write_atomic;

pub const MAX_FIELD_CHARS: usize = 512;
pub const FAILURE_LOG_FILE: &str = "failures.jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub kind: String,
    pub message: String,
}

pub fn truncate_field(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

pub struct FailureLog {
    path: PathBuf,
    run_id: String,
    max_entries: usize,
    written: AtomicUsize,
    write_lock: Mutex<()>,
}

impl FailureLog {
    /// Opens the log, first trimming an existing file to its newest
    /// `max_entries` lines. At most `max_entries` records are appended per run.
    pub fn open(path: impl Into<PathBuf>, max_entries: usize, run_id: impl Into<String>) -> Self {
        let path = path.into();
        trim_to_newest(&path, max_entries);
        Self {
            path,
            run_id: run_id.into(),
            max_entries,
            written: AtomicUsize::new(0),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries_written(&self) -> usize {
        self.written.load(Ordering::Relaxed)
    }

    pub fn record_asset(&self, item_id: &str, error: &AssetError) {
        self.record(Some(item_id), Some(error.reference()), error.kind(), &error.to_string());
    }

    pub fn record_item(&self, item_id: &str, kind: &str, message: &str) {
        self.record(Some(item_id), None, kind, message);
    }

    pub fn record(&self, item_id: Option<&str>, reference: Option<&str>, kind: &str, message: &str) {
        let slot = self.written.fetch_add(1, Ordering::Relaxed);
        if slot >= self.max_entries {
            if slot == self.max_entries {
                warn!(max_entries = self.max_entries, "[SYNC] Failure log limit reached, dropping further entries");
            }
            return;
        }

        let record = FailureRecord {
            timestamp: Utc::now(),
            run_id: self.run_id.clone(),
            item_id: item_id.map(|s| truncate_field(s, MAX_FIELD_CHARS)),
            reference: reference.map(|s| truncate_field(s, MAX_FIELD_CHARS)),
            kind: truncate_field(kind, MAX_FIELD_CHARS),
            message: truncate_field(message, MAX_FIELD_CHARS),
        };
        if let Err(e) = self.append(&record) {
            warn!(path = %self.path.display(), error = %e, "[SYNC] Could not write failure log entry");
        }
    }

    fn append(&self, record: &FailureRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}

fn trim_to_newest(path: &Path, max_entries: usize) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };
    let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() <= max_entries {
        return;
    }
    let mut kept = lines[lines.len() - max_entries..].join("\n");
    if !kept.is_empty() {
        kept.push('\n');
    }
    match write_atomic(path, kept.as_bytes()) {
        Ok(()) => debug!(path = %path.display(), dropped = lines.len() - max_entries, "[SYNC] Failure log trimmed"),
        Err(e) => warn!(path = %path.display(), error = %e, "[SYNC] Could not trim failure log"),
    }
}

/// Reads every well-formed record; malformed lines are skipped.
pub fn read_failure_log(path: &Path) -> Vec<FailureRecord> {
    fs::read_to_string(path)
        .map(|contents| {
            contents
                .lines()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect()
        })
        .unwrap_or_default()
}

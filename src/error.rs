//! Error taxonomy for the ingestion core.
//!
//! Per-asset errors ([`AssetError`]) never escape the item that produced them,
//! per-item errors never escape the batch, and only [`SyncError`] is allowed
//! to end a run early.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Failure resolving a single embedded asset reference.
///
/// `Clone` so that one in-flight download can hand the same outcome to every
/// waiter registered for that reference.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AssetError {
    /// The reference is malformed or not on the allow-list. Never retried.
    #[error("invalid asset reference {reference}: {reason}")]
    Validation { reference: String, reason: String },

    /// Network or timeout failure that survived every download attempt.
    #[error("transient failure fetching {reference} after {attempts} attempt(s): {message}")]
    TransientIo {
        reference: String,
        attempts: u32,
        message: String,
    },

    /// The remote asset is permanently unavailable or unusable.
    #[error("asset {reference} unavailable: {message}")]
    PersistentContent { reference: String, message: String },
}

impl AssetError {
    pub fn reference(&self) -> &str {
        match self {
            AssetError::Validation { reference, .. }
            | AssetError::TransientIo { reference, .. }
            | AssetError::PersistentContent { reference, .. } => reference,
        }
    }

    /// Short machine-readable kind, used in the failure log.
    pub fn kind(&self) -> &'static str {
        match self {
            AssetError::Validation { .. } => "validation",
            AssetError::TransientIo { .. } => "transient_io",
            AssetError::PersistentContent { .. } => "persistent_content",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AssetError::TransientIo { .. })
    }
}

/// Error returned by a [`crate::contract::Fetcher`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Worth another attempt (timeouts, connection resets, 408/429/5xx).
    #[error("transient fetch error: {0}")]
    Transient(String),

    /// Retrying will not help (404, 403 on an expired link, bad payload).
    #[error("permanent fetch error: {0}")]
    Permanent(String),
}

/// Failures of the durable caches.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache document {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Misconfiguration of the resource manager.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("malformed concurrency override entry '{0}', expected class:value")]
    MalformedOverride(String),

    #[error("unknown operation class '{0}' in concurrency override")]
    UnknownClass(String),

    #[error("concurrency override for '{class}' must be a positive integer, got '{value}'")]
    InvalidValue { class: String, value: String },

    #[error("operation class '{class}' has min {min} greater than max {max}")]
    InvalidBounds { class: String, min: usize, max: usize },
}

/// Upstream content-source failures.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse source manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("item {0} not found in source")]
    NotFound(String),

    #[error("source error: {0}")]
    Other(String),
}

/// Failure of one item's pipeline. Contained by the batch executor.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("failed to fetch content: {0}")]
    Fetch(Arc<SourceError>),

    #[error("variant '{variant}' transform failed: {source}")]
    Variant {
        variant: String,
        #[source]
        source: SourceError,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that end a synchronisation run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to create cache directory {path}: {source}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("invalid forbidden-reference pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

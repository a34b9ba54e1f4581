#![allow(unused)]

//! # contract: collaborator seams of the ingestion core
//!
//! The core never talks to the outside world directly. Everything it
//! consumes goes through one of the traits below:
//!
//! - [`ContentSource`]: lists items (id + last-modified stamp) and fetches
//!   their raw document text.
//! - [`Fetcher`]: downloads the bytes behind one asset reference.
//! - [`VariantTransform`]: rewrites a document for one output variant
//!   (e.g. a translation). The identity transform is [`IdentityVariant`].
//! - [`ResourceProvider`]: reports host CPU and memory for concurrency sizing.
//!
//! ## Mocking & Testing
//! - Each trait is annotated for `mockall` so tests can drive the core with
//!   deterministic collaborators (`MockContentSource`, `MockFetcher`, ...).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mockall::{automock, predicate::*};

use crate::error::{FetchError, SourceError};

/// One content item as reported by the upstream listing.
///
/// Both `id` and `last_modified` are required: together they form the
/// [`crate::prefetch::CacheKey`] used to detect change without re-fetching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// ISO-8601 last-modified stamp.
    pub last_modified: DateTime<Utc>,
}

/// Raw bytes of a downloaded asset plus the declared content type, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAsset {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Point-in-time view of host resources, read fresh for every concurrency decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    pub cpu_cores: usize,
    pub free_memory_gb: f64,
    pub total_memory_gb: f64,
}

/// Upstream content listing and fetch.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// List every item currently present upstream.
    async fn list_items(&self) -> Result<Vec<SourceItem>, SourceError>;

    /// Fetch the raw document text of one item.
    async fn fetch_content(&self, item: &SourceItem) -> Result<String, SourceError>;
}

/// Downloads the bytes behind an asset reference. One call is one attempt;
/// retrying is the caller's job.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedAsset, FetchError>;
}

/// Per-variant document rewrite, applied before asset resolution.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait VariantTransform: Send + Sync {
    async fn apply(&self, variant: &str, text: String) -> Result<String, SourceError>;
}

/// Host CPU and memory accessor.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait ResourceProvider: Send + Sync {
    fn snapshot(&self) -> ResourceSnapshot;
}

/// Variant transform that returns the document unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityVariant;

#[async_trait]
impl VariantTransform for IdentityVariant {
    async fn apply(&self, _variant: &str, text: String) -> Result<String, SourceError> {
        Ok(text)
    }
}

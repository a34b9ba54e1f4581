//! `ContentSource` backed by a local JSON manifest.
//!
//! ```json
//! { "items": [
//!     { "id": "intro", "title": "Intro", "lastModified": "2024-05-01T10:00:00Z", "path": "intro.md" },
//!     { "id": "faq", "lastModified": "2024-05-02T09:30:00Z", "content": "# FAQ" }
//! ] }
//! ```
//!
//! `path` is resolved against the manifest's directory. An item carries
//! either a `path` or inline `content`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::contract::{ContentSource, SourceItem};
use crate::error::SourceError;

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    items: Vec<ManifestItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestItem {
    id: String,
    #[serde(default)]
    title: String,
    last_modified: DateTime<Utc>,
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    content: Option<String>,
}

pub struct ManifestSource {
    manifest_path: PathBuf,
}

impl ManifestSource {
    pub fn new(manifest_path: impl Into<PathBuf>) -> Self {
        Self {
            manifest_path: manifest_path.into(),
        }
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    async fn read_manifest(&self) -> Result<Vec<ManifestItem>, SourceError> {
        let raw = tokio::fs::read_to_string(&self.manifest_path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.manifest_path.clone(),
                source,
            })?;
        let manifest: Manifest = serde_json::from_str(&raw)?;
        Ok(manifest.items)
    }

    fn base_dir(&self) -> PathBuf {
        self.manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}

#[async_trait]
impl ContentSource for ManifestSource {
    async fn list_items(&self) -> Result<Vec<SourceItem>, SourceError> {
        let items = self.read_manifest().await?;
        info!(manifest = %self.manifest_path.display(), items = items.len(), "[SYNC] Manifest listed");
        Ok(items
            .into_iter()
            .map(|item| SourceItem {
                id: item.id,
                title: item.title,
                last_modified: item.last_modified,
            })
            .collect())
    }

    async fn fetch_content(&self, item: &SourceItem) -> Result<String, SourceError> {
        let items: HashMap<String, ManifestItem> = self
            .read_manifest()
            .await?
            .into_iter()
            .map(|i| (i.id.clone(), i))
            .collect();
        let entry = items
            .get(&item.id)
            .ok_or_else(|| SourceError::NotFound(item.id.clone()))?;

        match (&entry.content, &entry.path) {
            (Some(content), _) => Ok(content.clone()),
            (None, Some(path)) => {
                let full = self.base_dir().join(path);
                debug!(id = %item.id, path = %full.display(), "[SYNC] Reading item content");
                tokio::fs::read_to_string(&full)
                    .await
                    .map_err(|source| SourceError::Io { path: full, source })
            }
            (None, None) => Err(SourceError::Other(format!(
                "item {} has neither content nor path",
                item.id
            ))),
        }
    }
}

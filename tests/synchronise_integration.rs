use async_trait::async_trait;
use asset_sync::config::Config;
use asset_sync::contract::{
    ContentSource, FetchedAsset, Fetcher, IdentityVariant, MockResourceProvider,
    MockVariantTransform, ResourceSnapshot, SourceItem, VariantTransform,
};
use asset_sync::error::{FetchError, SourceError};
use asset_sync::failure_log::{read_failure_log, FAILURE_LOG_FILE};
use asset_sync::output::output_path;
use asset_sync::progress::NoopProgressSink;
use asset_sync::references::PLACEHOLDER_REFERENCE;
use asset_sync::sync_cache::{SyncLedger, LEDGER_FILE};
use asset_sync::synchronise::{synchronise_with, Collaborators};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

const SIGNED_OK: &str = "https://bucket.s3.test/img/a.gif?X-Amz-Signature=abc&X-Amz-Expires=60";
const SIGNED_GONE: &str = "https://bucket.s3.test/img/gone.gif?X-Amz-Signature=def";

/// In-memory upstream whose listing can change between runs.
#[derive(Default)]
struct FakeSource {
    items: Mutex<BTreeMap<String, (SourceItem, String)>>,
    fetches: AtomicUsize,
}

impl FakeSource {
    fn put(&self, id: &str, last_modified: DateTime<Utc>, text: &str) {
        let item = SourceItem {
            id: id.to_string(),
            title: id.to_uppercase(),
            last_modified,
        };
        self.items
            .lock()
            .unwrap()
            .insert(id.to_string(), (item, text.to_string()));
    }

    fn remove(&self, id: &str) {
        self.items.lock().unwrap().remove(id);
    }
}

#[async_trait]
impl ContentSource for FakeSource {
    async fn list_items(&self) -> Result<Vec<SourceItem>, SourceError> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .values()
            .map(|(item, _)| item.clone())
            .collect())
    }

    async fn fetch_content(&self, item: &SourceItem) -> Result<String, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let items = self.items.lock().unwrap();
        match items.get(&item.id) {
            Some((_, text)) if text == "FAIL" => Err(SourceError::Other("upstream 500".into())),
            Some((_, text)) => Ok(text.clone()),
            None => Err(SourceError::NotFound(item.id.clone())),
        }
    }
}

/// Serves a GIF per URL; anything containing `gone` is a permanent 404.
#[derive(Default)]
struct FakeFetcher {
    calls: AtomicUsize,
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedAsset, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if url.contains("gone") {
            return Err(FetchError::Permanent("HTTP 404".into()));
        }
        let mut bytes = b"GIF89a".to_vec();
        bytes.extend_from_slice(url.as_bytes());
        Ok(FetchedAsset {
            bytes,
            content_type: Some("image/gif".into()),
        })
    }
}

struct Harness {
    _dir: TempDir,
    config: Config,
    source: Arc<FakeSource>,
    fetcher: Arc<FakeFetcher>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let yaml = format!(
            "source:\n  manifest: {manifest}\noutput_dir: {out}\ncache_dir: {cache}\nassets:\n  backoff_base_ms: 0\nbatch:\n  item_timeout_ms: 10000\n",
            manifest = dir.path().join("unused.json").display(),
            out = dir.path().join("out").display(),
            cache = dir.path().join("cache").display(),
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        Self {
            _dir: dir,
            config,
            source: Arc::new(FakeSource::default()),
            fetcher: Arc::new(FakeFetcher::default()),
        }
    }

    fn collaborators(&self) -> Collaborators {
        self.collaborators_with(Arc::new(IdentityVariant))
    }

    fn collaborators_with(&self, variant_transform: Arc<dyn VariantTransform>) -> Collaborators {
        let mut resources = MockResourceProvider::new();
        resources.expect_snapshot().returning(|| ResourceSnapshot {
            cpu_cores: 4,
            free_memory_gb: 8.0,
            total_memory_gb: 16.0,
        });
        Collaborators {
            source: self.source.clone(),
            fetcher: self.fetcher.clone(),
            variant_transform,
            resources: Arc::new(resources),
            progress_sink: Arc::new(NoopProgressSink),
        }
    }

    fn output(&self, id: &str) -> PathBuf {
        self.variant_output("en", id)
    }

    fn variant_output(&self, variant: &str, id: &str) -> PathBuf {
        output_path(&self.config.output_dir, variant, id)
    }

    fn ledger(&self) -> SyncLedger {
        SyncLedger::load(&self.config.cache_dir.join(LEDGER_FILE)).unwrap()
    }
}

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap()
}

/// Tags each variant's text; `failing` is a `(variant, text)` pair that errors.
fn tagging_variants(failing: Option<(&'static str, &'static str)>) -> Arc<dyn VariantTransform> {
    let mut transform = MockVariantTransform::new();
    transform
        .expect_apply()
        .returning(move |variant: &str, text: String| match failing {
            Some((bad_variant, bad_text)) if bad_variant == variant && bad_text == text => {
                Err(SourceError::Other(format!("no {variant} rendering")))
            }
            _ => Ok(format!("[{variant}] {text}")),
        });
    Arc::new(transform)
}

#[tokio::test]
async fn first_run_localises_assets_and_second_run_is_a_no_op() {
    let h = Harness::new();
    h.source.put(
        "page-a",
        at(1),
        &format!("# A\n\n![diagram]({SIGNED_OK})\n"),
    );
    h.source.put("page-b", at(1), "# B\n\nno assets here\n");

    let first = synchronise_with(&h.config, h.collaborators()).await.unwrap();
    assert!(first.full_rebuild);
    assert_eq!((first.listed, first.processed, first.succeeded), (2, 2, 2));
    assert_eq!(first.downloads, 1);
    assert!(first.is_clean());

    let written = fs::read_to_string(h.output("page-a")).unwrap();
    assert!(!written.contains("X-Amz-"), "signed link must be gone: {written}");
    assert!(written.contains("![diagram](/assets/"));
    assert_eq!(h.ledger().len(), 2);

    let second = synchronise_with(&h.config, h.collaborators()).await.unwrap();
    assert!(!second.full_rebuild);
    assert_eq!(second.processed, 0);
    assert_eq!(second.skipped, second.listed);
    assert_eq!(second.downloads, 0);
    assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fs::read_to_string(h.output("page-a")).unwrap(), written);
}

#[tokio::test]
async fn forced_rebuild_reuses_the_asset_cache() {
    let mut h = Harness::new();
    h.source
        .put("page-a", at(1), &format!("![d]({SIGNED_OK})"));
    synchronise_with(&h.config, h.collaborators()).await.unwrap();

    h.config.force = true;
    let report = synchronise_with(&h.config, h.collaborators()).await.unwrap();
    assert!(report.full_rebuild);
    assert_eq!(report.processed, 1);
    assert_eq!(report.downloads, 0);
    assert_eq!(report.cache_hits, 1);
    assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unresolvable_signed_link_is_scrubbed_and_retried_next_run() {
    let h = Harness::new();
    h.source
        .put("page-x", at(1), &format!("see ![lost]({SIGNED_GONE}) here"));

    let report = synchronise_with(&h.config, h.collaborators()).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.still_broken, 1);
    assert!(!report.is_clean());

    let written = fs::read_to_string(h.output("page-x")).unwrap();
    assert_eq!(written, format!("see ![lost]({PLACEHOLDER_REFERENCE}) here"));
    assert!(h.ledger().record("page-x").unwrap().contains_forbidden_refs);

    let failures = read_failure_log(&h.config.cache_dir.join(FAILURE_LOG_FILE));
    assert!(failures.iter().any(|r| r.kind == "still_broken"));
    assert!(failures
        .iter()
        .any(|r| r.reference.as_deref() == Some(SIGNED_GONE)));

    let again = synchronise_with(&h.config, h.collaborators()).await.unwrap();
    assert_eq!(again.processed, 1, "broken items are reprocessed");
}

#[tokio::test]
async fn deleted_item_loses_its_output_and_record() {
    let h = Harness::new();
    h.source.put("keep", at(1), "kept");
    h.source.put("drop", at(1), "dropped");
    synchronise_with(&h.config, h.collaborators()).await.unwrap();
    assert!(h.output("drop").is_file());

    h.source.remove("drop");
    let report = synchronise_with(&h.config, h.collaborators()).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert!(!h.output("drop").exists());
    assert!(h.output("keep").is_file());
    assert!(h.ledger().record("drop").is_none());
}

#[tokio::test]
async fn empty_listing_keeps_ledger_and_outputs() {
    let h = Harness::new();
    h.source.put("only", at(1), "content");
    synchronise_with(&h.config, h.collaborators()).await.unwrap();

    h.source.remove("only");
    let report = synchronise_with(&h.config, h.collaborators()).await.unwrap();
    assert_eq!(report.listed, 0);
    assert_eq!(report.deleted, 0);
    assert!(h.output("only").is_file());
    assert!(h.ledger().record("only").is_some());
}

#[tokio::test]
async fn failing_item_is_isolated_and_flagged_for_retry() {
    let h = Harness::new();
    h.source.put("good", at(1), "fine");
    h.source.put("bad", at(1), "FAIL");

    let report = synchronise_with(&h.config, h.collaborators()).await.unwrap();
    assert_eq!((report.succeeded, report.failed), (1, 1));
    assert!(h.output("good").is_file());
    assert!(!h.output("bad").exists());

    let ledger = h.ledger();
    assert!(!ledger.record("good").unwrap().needs_retry);
    let bad = ledger.record("bad").expect("failed items are recorded");
    assert!(bad.needs_retry);
    assert_eq!(bad.last_edited, DateTime::<Utc>::UNIX_EPOCH);
    assert!(bad.output_paths.contains(&h.output("bad")));

    let again = synchronise_with(&h.config, h.collaborators()).await.unwrap();
    assert_eq!(again.processed, 1);
}

#[tokio::test]
async fn recovered_item_clears_its_retry_flag() {
    let h = Harness::new();
    h.source.put("flaky", at(1), "FAIL");
    synchronise_with(&h.config, h.collaborators()).await.unwrap();
    assert!(h.ledger().record("flaky").unwrap().needs_retry);

    h.source.put("flaky", at(1), "better now");
    let report = synchronise_with(&h.config, h.collaborators()).await.unwrap();
    assert_eq!((report.processed, report.succeeded), (1, 1));
    let record = h.ledger().record("flaky").unwrap().clone();
    assert!(!record.needs_retry);
    assert_eq!(record.last_edited, at(1));

    let idle = synchronise_with(&h.config, h.collaborators()).await.unwrap();
    assert_eq!(idle.processed, 0);
}

#[tokio::test]
async fn unreachable_image_becomes_placeholder_and_is_retried_next_run() {
    let h = Harness::new();
    h.source
        .put("page", at(1), "before ![pic](https://cdn.test/gone.png) after");

    let report = synchronise_with(&h.config, h.collaborators()).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.still_broken, 1);
    assert!(!report.is_clean());

    let written = fs::read_to_string(h.output("page")).unwrap();
    assert_eq!(written, format!("before ![pic]({PLACEHOLDER_REFERENCE}) after"));

    let record = h.ledger().record("page").unwrap().clone();
    assert!(record.needs_retry);
    assert!(!record.contains_forbidden_refs);
    let failures = read_failure_log(&h.config.cache_dir.join(FAILURE_LOG_FILE));
    assert!(failures.iter().any(|r| r.kind == "asset_unresolved"));

    let again = synchronise_with(&h.config, h.collaborators()).await.unwrap();
    assert_eq!(again.processed, 1, "items with placeholders are reprocessed");
}

#[tokio::test]
async fn every_variant_is_written_and_tracked() {
    let mut h = Harness::new();
    h.config.variants = vec!["en".to_string(), "de".to_string()];
    h.source.put("doc", at(1), &format!("![d]({SIGNED_OK})"));

    let report = synchronise_with(&h.config, h.collaborators_with(tagging_variants(None)))
        .await
        .unwrap();
    assert!(report.is_clean());
    assert_eq!(report.downloads, 1, "variants share one download");

    for variant in ["en", "de"] {
        let written = fs::read_to_string(h.variant_output(variant, "doc")).unwrap();
        assert!(written.starts_with(&format!("[{variant}] ![d](/assets/")), "{written}");
    }
    let record = h.ledger().record("doc").unwrap().clone();
    assert_eq!(record.output_paths.len(), 2);
    assert_eq!(h.source.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_variant_leaves_sibling_output_tracked_for_deletion() {
    let mut h = Harness::new();
    h.config.variants = vec!["en".to_string(), "de".to_string()];
    h.source.put("doc", at(1), "body");
    h.source.put("other", at(1), "stays");

    let report = synchronise_with(&h.config, h.collaborators_with(tagging_variants(Some(("de", "body")))))
        .await
        .unwrap();
    assert_eq!((report.succeeded, report.failed), (1, 1));
    assert!(h.variant_output("en", "doc").is_file());
    assert!(!h.variant_output("de", "doc").exists());

    let record = h.ledger().record("doc").unwrap().clone();
    assert!(record.needs_retry);
    assert!(record.output_paths.contains(&h.variant_output("en", "doc")));

    h.source.remove("doc");
    let report = synchronise_with(&h.config, h.collaborators_with(tagging_variants(Some(("de", "body")))))
        .await
        .unwrap();
    assert_eq!(report.deleted, 1);
    assert!(!h.variant_output("en", "doc").exists(), "orphaned variant output is removed");
    assert!(h.ledger().record("doc").is_none());
    assert!(h.variant_output("en", "other").is_file());
}

#[tokio::test]
async fn ids_that_sanitise_alike_keep_separate_outputs() {
    let h = Harness::new();
    h.source.put("a.b", at(1), "dot");
    h.source.put("a_b", at(1), "underscore");
    h.source.put("a/b", at(1), "slash");

    let report = synchronise_with(&h.config, h.collaborators()).await.unwrap();
    assert_eq!(report.succeeded, 3);
    assert_eq!(fs::read_to_string(h.output("a.b")).unwrap(), "dot");
    assert_eq!(fs::read_to_string(h.output("a_b")).unwrap(), "underscore");
    assert_eq!(fs::read_to_string(h.output("a/b")).unwrap(), "slash");

    h.source.remove("a.b");
    let report = synchronise_with(&h.config, h.collaborators()).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert!(!h.output("a.b").exists());
    assert_eq!(fs::read_to_string(h.output("a_b")).unwrap(), "underscore");
    assert_eq!(fs::read_to_string(h.output("a/b")).unwrap(), "slash");
}

#[tokio::test]
async fn modified_item_is_reprocessed() {
    let h = Harness::new();
    h.source.put("page", at(1), "v1");
    synchronise_with(&h.config, h.collaborators()).await.unwrap();

    h.source.put("page", at(2), "v2");
    let fetches_before = h.source.fetches.load(Ordering::SeqCst);
    let report = synchronise_with(&h.config, h.collaborators()).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(h.source.fetches.load(Ordering::SeqCst), fetches_before + 1);
    assert_eq!(fs::read_to_string(h.output("page")).unwrap(), "v2");
    assert_eq!(h.ledger().record("page").unwrap().last_edited, at(2));
}

//! Coordinating module for the list → filter → process → record pipeline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::asset_cache::AssetCache;
use crate::batch::{BatchExecutor, BatchOptions, Settlement};
use crate::config::{pipeline_fingerprint, Config};
use crate::contract::{
    ContentSource, Fetcher, IdentityVariant, ResourceProvider, SourceItem, VariantTransform,
};
use crate::download::{AssetResolver, HttpFetcher};
use crate::error::{CacheError, ItemError, SyncError};
use crate::failure_log::{FailureLog, FAILURE_LOG_FILE};
use crate::output::{output_path, remove_outputs, write_atomic};
use crate::prefetch::{CacheKey, PrefetchCache};
use crate::progress::{ProgressSink, ProgressTracker, TracingProgressSink};
use crate::references::{ForbiddenPredicate, ResolvingTransform};
use crate::resource::{OperationClass, ResourceManager, SystemResources};
use crate::retry::RetryOrchestrator;
use crate::source::ManifestSource;
use crate::sync_cache::{
    determine_sync_mode, filter_changed_items, find_deleted_items, SyncLedger, LEDGER_FILE,
};

pub const ASSETS_DIR: &str = "assets";

/// The outside world as seen by one run.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn ContentSource>,
    pub fetcher: Arc<dyn Fetcher>,
    pub variant_transform: Arc<dyn VariantTransform>,
    pub resources: Arc<dyn ResourceProvider>,
    pub progress_sink: Arc<dyn ProgressSink>,
}

impl Collaborators {
    /// Production wiring: manifest source, HTTP fetcher, host resources.
    pub fn from_config(config: &Config) -> Result<Self, SyncError> {
        Ok(Self {
            source: Arc::new(ManifestSource::new(&config.source.manifest)),
            fetcher: Arc::new(HttpFetcher::new(config.assets.request_timeout())?),
            variant_transform: Arc::new(IdentityVariant),
            resources: Arc::new(SystemResources),
            progress_sink: Arc::new(TracingProgressSink::new("items")),
        })
    }
}

/// Summary of one run.
#[derive(Debug, Clone, Serialize)]
pub struct SynchroniseReport {
    pub run_id: String,
    pub full_rebuild: bool,
    pub mode: String,
    pub listed: usize,
    pub processed: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Written, but some assets had to be replaced by the placeholder.
    pub still_broken: usize,
    pub deleted: usize,
    pub bytes_saved: u64,
    pub downloads: u64,
    pub cache_hits: u64,
}

impl SynchroniseReport {
    /// `false` when any item failed or is still broken.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.still_broken == 0
    }
}

/// Result of one item's pipeline.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub id: String,
    pub output_paths: Vec<PathBuf>,
    /// Forbidden references were scrubbed from at least one variant.
    pub still_broken: bool,
    /// Ordinary images that stayed remote and were replaced by the placeholder.
    pub unresolved_assets: usize,
    pub bytes_saved: u64,
    pub attempts_used: u32,
}

struct ItemContext {
    source: Arc<dyn ContentSource>,
    variant_transform: Arc<dyn VariantTransform>,
    prefetch: PrefetchCache<String>,
    retry: RetryOrchestrator,
    transform: ResolvingTransform,
    failure_log: Arc<FailureLog>,
    variants: Vec<String>,
    output_dir: PathBuf,
}

/// Entrypoint: synchronise with the production collaborators.
pub async fn synchronise(config: &Config) -> Result<SynchroniseReport, SyncError> {
    let collaborators = Collaborators::from_config(config)?;
    synchronise_with(config, collaborators).await
}

/// Synchronise against explicit collaborators.
pub async fn synchronise_with(
    config: &Config,
    collaborators: Collaborators,
) -> Result<SynchroniseReport, SyncError> {
    let run_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("sync", run_id = %run_id);
    run(config, collaborators, run_id).instrument(span).await
}

async fn run(
    config: &Config,
    collaborators: Collaborators,
    run_id: String,
) -> Result<SynchroniseReport, SyncError> {
    info!("[SYNC] Starting synchronisation");

    std::fs::create_dir_all(&config.cache_dir).map_err(|source| {
        error!(path = %config.cache_dir.display(), error = %source, "[SYNC][ERROR] Cannot create cache directory");
        SyncError::CacheDir {
            path: config.cache_dir.clone(),
            source,
        }
    })?;

    let resources = ResourceManager::new(collaborators.resources.clone())
        .with_overrides(config.concurrency_override.as_deref().unwrap_or(""))?;
    let asset_cache = Arc::new(AssetCache::open(config.cache_dir.join(ASSETS_DIR))?);
    let failure_log = Arc::new(FailureLog::open(
        config.cache_dir.join(FAILURE_LOG_FILE),
        config.failure_log_max_entries,
        run_id.clone(),
    ));
    let predicate = Arc::new(ForbiddenPredicate::new(&config.assets.forbidden_patterns)?);
    let resolver = Arc::new(
        AssetResolver::new(
            asset_cache,
            collaborators.fetcher.clone(),
            config.assets.resolver_settings(),
        )
        .with_download_limit(resources.concurrency(&OperationClass::DOWNLOADS)),
    );

    let fingerprint = pipeline_fingerprint(config);
    let ledger_path = config.cache_dir.join(LEDGER_FILE);
    let mode = determine_sync_mode(&ledger_path, &fingerprint, config.force);

    let listed = match collaborators.source.list_items().await {
        Ok(items) => dedupe_by_id(items),
        Err(e) => {
            warn!(error = %e, "[SYNC] Source listing failed, treating as empty");
            failure_log.record(None, None, "listing_failed", &e.to_string());
            Vec::new()
        }
    };
    info!(listed = listed.len(), full_rebuild = mode.full_rebuild, reason = %mode.reason, "[SYNC] Source listed");

    let mut ledger = mode.cache;
    let deleted = find_deleted_items(listed.iter().map(|i| i.id.as_str()), &ledger);
    for id in &deleted {
        if let Some(record) = ledger.remove_item(id) {
            let removed = remove_outputs(&record.output_paths);
            info!(id = %id, removed, "[SYNC] Item deleted upstream");
        }
    }

    let to_process = if mode.full_rebuild {
        listed.clone()
    } else {
        filter_changed_items(&listed, &ledger)
    };
    let skipped = listed.len() - to_process.len();
    info!(processing = to_process.len(), skipped, deleted = deleted.len(), "[SYNC] Work planned");

    let ctx = Arc::new(ItemContext {
        source: collaborators.source.clone(),
        variant_transform: collaborators.variant_transform.clone(),
        prefetch: PrefetchCache::new(config.prefetch_capacity),
        retry: RetryOrchestrator::new(config.retry.max_attempts),
        transform: ResolvingTransform {
            resolver: resolver.clone(),
            predicate: predicate.clone(),
            failure_log: Some(failure_log.clone()),
        },
        failure_log: failure_log.clone(),
        variants: config.variants.clone(),
        output_dir: config.output_dir.clone(),
    });

    let progress = Arc::new(ProgressTracker::new(
        to_process.len(),
        collaborators.progress_sink.clone(),
    ));
    let ledger = Arc::new(Mutex::new(ledger));
    let (ledger_tx, ledger_writer) = spawn_ledger_writer(ledger.clone(), ledger_path.clone());
    let mut options = BatchOptions::new(resources.concurrency(&OperationClass::PAGES))
        .with_progress(progress.clone())
        .on_settled(settlement_recorder(
            Arc::new(to_process.clone()),
            ledger,
            ledger_tx.clone(),
            failure_log.clone(),
            config.output_dir.clone(),
            config.variants.clone(),
        ));
    if let Some(timeout) = config.item_timeout() {
        options = options.with_timeout(timeout);
    }

    let settlements = BatchExecutor::process(
        to_process.clone(),
        {
            let ctx = ctx.clone();
            move |item| process_item(ctx.clone(), item)
        },
        options,
    )
    .await;
    progress.finish();

    let mut succeeded = 0;
    let mut still_broken = 0;
    let mut bytes_saved = 0;
    for settlement in &settlements {
        if let Settlement::Fulfilled(outcome) = settlement {
            succeeded += 1;
            bytes_saved += outcome.bytes_saved;
            if outcome.still_broken || outcome.unresolved_assets > 0 {
                still_broken += 1;
            }
        }
    }

    let _ = ledger_tx.send(LedgerMessage::Finish);
    drop(ledger_tx);
    match ledger_writer.await {
        Ok(saved) => saved?,
        Err(join_error) => {
            return Err(CacheError::io(
                &ledger_path,
                std::io::Error::other(join_error.to_string()),
            )
            .into())
        }
    }

    let stats = resolver.stats();
    let report = SynchroniseReport {
        run_id,
        full_rebuild: mode.full_rebuild,
        mode: mode.reason.to_string(),
        listed: listed.len(),
        processed: to_process.len(),
        skipped,
        succeeded,
        failed: settlements.len() - succeeded,
        still_broken,
        deleted: deleted.len(),
        bytes_saved,
        downloads: stats.downloads,
        cache_hits: stats.cache_hits,
    };
    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        still_broken = report.still_broken,
        bytes_saved = report.bytes_saved,
        downloads = report.downloads,
        cache_hits = report.cache_hits,
        "[SYNC] Synchronisation complete"
    );
    Ok(report)
}

/// Keeps one entry per id, the one with the newest stamp.
fn dedupe_by_id(items: Vec<SourceItem>) -> Vec<SourceItem> {
    let mut order = Vec::new();
    let mut newest: HashMap<String, SourceItem> = HashMap::new();
    for item in items {
        match newest.get(&item.id) {
            Some(existing) if existing.last_modified >= item.last_modified => {
                debug!(id = %item.id, "[SYNC] Dropping duplicate listing entry");
            }
            Some(_) => {
                newest.insert(item.id.clone(), item);
            }
            None => {
                order.push(item.id.clone());
                newest.insert(item.id.clone(), item);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|id| newest.remove(&id))
        .collect()
}

#[derive(Debug)]
enum LedgerMessage {
    /// The in-memory ledger changed.
    Dirty,
    /// Stamp the run and do the final, fatal save.
    Finish,
}

/// Starts the single task that persists the ledger. Saves run on the
/// blocking pool; bursts of `Dirty` collapse into one save.
fn spawn_ledger_writer(
    ledger: Arc<Mutex<SyncLedger>>,
    path: PathBuf,
) -> (UnboundedSender<LedgerMessage>, JoinHandle<Result<(), CacheError>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(write_ledger(ledger, path, rx).in_current_span());
    (tx, handle)
}

async fn write_ledger(
    ledger: Arc<Mutex<SyncLedger>>,
    path: PathBuf,
    mut rx: UnboundedReceiver<LedgerMessage>,
) -> Result<(), CacheError> {
    while let Some(message) = rx.recv().await {
        let mut finish = matches!(message, LedgerMessage::Finish);
        while let Ok(next) = rx.try_recv() {
            finish |= matches!(next, LedgerMessage::Finish);
        }

        let snapshot = {
            let mut ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
            if finish {
                ledger.mark_synced();
            }
            ledger.clone()
        };
        let saved = save_ledger(snapshot, path.clone()).await;
        if finish {
            return saved;
        }
        if let Err(e) = saved {
            warn!(error = %e, "[SYNC] Could not persist sync ledger after item");
        }
    }
    Ok(())
}

async fn save_ledger(snapshot: SyncLedger, path: PathBuf) -> Result<(), CacheError> {
    let target = path.clone();
    match tokio::task::spawn_blocking(move || snapshot.save(&target)).await {
        Ok(result) => result,
        Err(join_error) => Err(CacheError::io(
            path,
            std::io::Error::other(join_error.to_string()),
        )),
    }
}

/// Every output path an item would produce, written or not.
fn expected_outputs(output_dir: &Path, variants: &[String], id: &str) -> Vec<PathBuf> {
    variants
        .iter()
        .map(|variant| output_path(output_dir, variant, id))
        .collect()
}

/// Merges each settled item into the in-memory ledger and asks the writer
/// to persist it.
///
/// Failed, timed-out and panicked items are recorded too: their output
/// paths are tracked so a later deletion removes any partial output, and
/// the record is flagged so the next run retries them.
fn settlement_recorder(
    items: Arc<Vec<SourceItem>>,
    ledger: Arc<Mutex<SyncLedger>>,
    writer: UnboundedSender<LedgerMessage>,
    failure_log: Arc<FailureLog>,
    output_dir: PathBuf,
    variants: Vec<String>,
) -> impl Fn(usize, &Settlement<ItemOutcome, ItemError>) + Send + Sync + 'static {
    move |index: usize, settlement: &Settlement<ItemOutcome, ItemError>| {
        let Some(item) = items.get(index) else {
            return;
        };
        match settlement {
            Settlement::Fulfilled(_) => {}
            Settlement::Rejected(e) => {
                warn!(id = %item.id, error = %e, "[SYNC] Item failed");
                failure_log.record_item(&item.id, "item_failed", &e.to_string());
            }
            Settlement::TimedOut => {
                failure_log.record_item(&item.id, "item_timeout", "abandoned after per-item timeout");
            }
            Settlement::Panicked(message) => {
                failure_log.record_item(&item.id, "item_panicked", message);
            }
        }

        {
            let mut ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
            match settlement {
                Settlement::Fulfilled(outcome) => {
                    ledger.update_item(
                        &item.id,
                        item.last_modified,
                        outcome.output_paths.iter().cloned(),
                        outcome.still_broken,
                    );
                    if outcome.unresolved_assets > 0 {
                        ledger.flag_for_retry(&item.id);
                    }
                }
                _ => ledger.record_failure(
                    &item.id,
                    expected_outputs(&output_dir, &variants, &item.id),
                ),
            }
        }

        if writer.send(LedgerMessage::Dirty).is_err() {
            debug!(id = %item.id, "[SYNC] Ledger writer already stopped");
        }
    }
}

async fn process_item(ctx: Arc<ItemContext>, item: SourceItem) -> Result<ItemOutcome, ItemError> {
    let raw = {
        let source = ctx.source.clone();
        let fetched_item = item.clone();
        ctx.prefetch
            .get_or_fetch(CacheKey::for_item(&item), move || async move {
                source.fetch_content(&fetched_item).await
            })
            .await
            .map_err(ItemError::Fetch)?
    };

    let mut output_paths = Vec::with_capacity(ctx.variants.len());
    let mut still_broken = false;
    let mut unresolved_assets = 0;
    let mut bytes_saved = 0;
    let mut attempts_used = 0;

    for variant in &ctx.variants {
        let text = ctx
            .variant_transform
            .apply(variant, raw.clone())
            .await
            .map_err(|source| ItemError::Variant {
                variant: variant.clone(),
                source,
            })?;

        let outcome = ctx
            .retry
            .run(
                text,
                |t| ctx.transform.predicate.holds(t),
                |t| ctx.transform.run_pass(&item.id, t),
            )
            .await;
        bytes_saved += outcome.bytes_saved;
        attempts_used = attempts_used.max(outcome.attempts_used);

        let scrubbed = ctx.transform.scrub_unresolved(&outcome.text);
        if scrubbed.forbidden > 0 {
            warn!(
                id = %item.id,
                variant = %variant,
                status = ?outcome.status,
                scrubbed = scrubbed.forbidden,
                "[SYNC] Forbidden references remain, writing scrubbed output"
            );
            ctx.failure_log.record_item(
                &item.id,
                "still_broken",
                &format!(
                    "variant {variant}: {} forbidden reference(s) scrubbed after {:?}",
                    scrubbed.forbidden, outcome.status
                ),
            );
            still_broken = true;
        }
        if scrubbed.unresolved > 0 {
            warn!(
                id = %item.id,
                variant = %variant,
                unresolved = scrubbed.unresolved,
                "[SYNC] Assets could not be made local, writing placeholders"
            );
            ctx.failure_log.record_item(
                &item.id,
                "asset_unresolved",
                &format!("variant {variant}: {} asset(s) replaced by placeholder", scrubbed.unresolved),
            );
            unresolved_assets += scrubbed.unresolved;
        }

        let path = output_path(&ctx.output_dir, variant, &item.id);
        write_output(&path, scrubbed.text).await?;
        output_paths.push(path);
    }

    debug!(id = %item.id, variants = output_paths.len(), still_broken, unresolved_assets, "[SYNC] Item processed");
    Ok(ItemOutcome {
        id: item.id,
        output_paths,
        still_broken,
        unresolved_assets,
        bytes_saved,
        attempts_used,
    })
}

async fn write_output(path: &Path, text: String) -> Result<(), ItemError> {
    let target = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || write_atomic(&target, text.as_bytes())).await;
    let io_result = match result {
        Ok(r) => r,
        Err(join_error) => Err(std::io::Error::other(join_error.to_string())),
    };
    io_result.map_err(|source| ItemError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Drops asset records whose backing file is gone.
pub fn cleanup_asset_cache(config: &Config) -> Result<usize, SyncError> {
    let cache = AssetCache::open(config.cache_dir.join(ASSETS_DIR))?;
    Ok(cache.cleanup()?)
}

//! Asset resolution: validate, consult the cache, download, optimise, store.
//!
//! [`AssetResolver::resolve`] turns one remote reference into a stable local
//! reference. Concurrent calls for the same reference share one download
//! through an in-flight registry, so a reference is fetched at most once per
//! process no matter how many documents embed it.

pub mod format;
pub mod optimise;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::asset_cache::{AssetCache, AssetMeta};
use crate::contract::{FetchedAsset, Fetcher};
use crate::error::{AssetError, FetchError};

pub use format::{detect_format, AssetFormat};
pub use optimise::{optimise, OptimiseSettings, Optimised};

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// Prepended to the stored filename to form the local reference.
    pub url_prefix: String,
    pub allowed_schemes: Vec<String>,
    /// Empty means any host. A listed host also admits its subdomains.
    pub allowed_hosts: Vec<String>,
    /// Attempts per download, including the first.
    pub download_attempts: u32,
    pub backoff_base: Duration,
    /// Upper bound of the random delay added to every backoff.
    pub backoff_jitter: Duration,
    pub optimise: OptimiseSettings,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            url_prefix: "/assets/".to_string(),
            allowed_schemes: vec!["https".to_string(), "http".to_string()],
            allowed_hosts: Vec::new(),
            download_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_jitter: Duration::from_millis(250),
            optimise: OptimiseSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub local_reference: String,
    pub filename: String,
    /// 0 on cache hits and whenever compression fell back.
    pub bytes_saved: u64,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub downloads: u64,
    pub cache_hits: u64,
    pub failures: u64,
    pub bytes_saved: u64,
}

#[derive(Default)]
struct Counters {
    downloads: AtomicU64,
    cache_hits: AtomicU64,
    failures: AtomicU64,
    bytes_saved: AtomicU64,
}

type PendingResolve = Shared<BoxFuture<'static, Result<ResolvedAsset, AssetError>>>;

pub struct AssetResolver {
    cache: Arc<AssetCache>,
    fetcher: Arc<dyn Fetcher>,
    settings: Arc<ResolverSettings>,
    download_slots: Arc<Semaphore>,
    in_flight: Mutex<HashMap<String, PendingResolve>>,
    counters: Arc<Counters>,
}

impl AssetResolver {
    pub fn new(cache: Arc<AssetCache>, fetcher: Arc<dyn Fetcher>, settings: ResolverSettings) -> Self {
        Self {
            cache,
            fetcher,
            settings: Arc::new(settings),
            download_slots: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
            in_flight: Mutex::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Caps how many downloads run at once across every caller.
    pub fn with_download_limit(mut self, limit: usize) -> Self {
        self.download_slots = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<AssetCache> {
        &self.cache
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            downloads: self.counters.downloads.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            bytes_saved: self.counters.bytes_saved.load(Ordering::Relaxed),
        }
    }

    pub fn validate(&self, reference: &str) -> Result<(), AssetError> {
        validate_reference(reference, &self.settings)
    }

    pub async fn resolve(&self, reference: &str) -> Result<ResolvedAsset, AssetError> {
        if let Err(e) = self.validate(reference) {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        if let Some(hit) = self.cache_hit(reference) {
            return Ok(hit);
        }

        let pending = {
            let mut in_flight = self.lock_in_flight();
            match in_flight.get(reference) {
                Some(existing) => {
                    debug!(reference, "[ASSET] Joining in-flight download");
                    existing.clone()
                }
                None => {
                    // a download may have been stored between the miss and the lock
                    if let Some(hit) = self.cache_hit(reference) {
                        return Ok(hit);
                    }
                    let fut = download_and_store(
                        reference.to_string(),
                        self.cache.clone(),
                        self.fetcher.clone(),
                        self.settings.clone(),
                        self.download_slots.clone(),
                        self.counters.clone(),
                    )
                    .boxed()
                    .shared();
                    in_flight.insert(reference.to_string(), fut.clone());
                    fut
                }
            }
        };

        let result = pending.clone().await;
        let mut in_flight = self.lock_in_flight();
        if in_flight
            .get(reference)
            .is_some_and(|current| current.ptr_eq(&pending))
        {
            in_flight.remove(reference);
        }
        drop(in_flight);
        result
    }

    fn cache_hit(&self, reference: &str) -> Option<ResolvedAsset> {
        let entry = self.cache.get(reference)?;
        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        debug!(reference, filename = %entry.local_filename, "[ASSET] Cache hit");
        Some(ResolvedAsset {
            local_reference: local_reference(&self.settings, &entry.local_filename),
            filename: entry.local_filename,
            bytes_saved: 0,
            cache_hit: true,
        })
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, PendingResolve>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn local_reference(settings: &ResolverSettings, filename: &str) -> String {
    format!("{}{}", settings.url_prefix, filename)
}

/// Scheme and host allow-list check. Runs before any network access.
pub fn validate_reference(reference: &str, settings: &ResolverSettings) -> Result<(), AssetError> {
    let invalid = |reason: String| AssetError::Validation {
        reference: reference.to_string(),
        reason,
    };

    let url = reqwest::Url::parse(reference).map_err(|e| invalid(format!("not a URL: {e}")))?;
    let scheme = url.scheme();
    if !settings
        .allowed_schemes
        .iter()
        .any(|s| s.eq_ignore_ascii_case(scheme))
    {
        return Err(invalid(format!("scheme '{scheme}' is not allowed")));
    }
    let host = url
        .host_str()
        .ok_or_else(|| invalid("missing host".to_string()))?
        .to_ascii_lowercase();
    if !settings.allowed_hosts.is_empty()
        && !settings.allowed_hosts.iter().any(|allowed| {
            let allowed = allowed.to_ascii_lowercase();
            host == allowed || host.ends_with(&format!(".{allowed}"))
        })
    {
        return Err(invalid(format!("host '{host}' is not allowed")));
    }
    Ok(())
}

/// `base * 2^(attempt-1)` plus up to `backoff_jitter` of random delay.
pub fn backoff_delay(settings: &ResolverSettings, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    let exponential = settings.backoff_base.saturating_mul(factor);
    let jitter_ms = settings.backoff_jitter.as_millis() as u64;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::rng().random_range(0..=jitter_ms)
    };
    exponential + Duration::from_millis(jitter)
}

async fn fetch_with_retry(
    reference: &str,
    fetcher: &dyn Fetcher,
    settings: &ResolverSettings,
) -> Result<FetchedAsset, AssetError> {
    let attempts = settings.download_attempts.max(1);
    let mut attempt = 1;
    loop {
        match fetcher.fetch(reference).await {
            Ok(asset) if asset.bytes.is_empty() => {
                return Err(AssetError::PersistentContent {
                    reference: reference.to_string(),
                    message: "empty response body".to_string(),
                });
            }
            Ok(asset) => return Ok(asset),
            Err(FetchError::Permanent(message)) => {
                warn!(reference, attempt, %message, "[ASSET] Permanent download failure");
                return Err(AssetError::PersistentContent {
                    reference: reference.to_string(),
                    message,
                });
            }
            Err(FetchError::Transient(message)) if attempt >= attempts => {
                warn!(reference, attempts, %message, "[ASSET] Download attempts exhausted");
                return Err(AssetError::TransientIo {
                    reference: reference.to_string(),
                    attempts,
                    message,
                });
            }
            Err(FetchError::Transient(message)) => {
                let delay = backoff_delay(settings, attempt);
                debug!(
                    reference,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %message,
                    "[ASSET] Transient download failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn download_and_store(
    reference: String,
    cache: Arc<AssetCache>,
    fetcher: Arc<dyn Fetcher>,
    settings: Arc<ResolverSettings>,
    slots: Arc<Semaphore>,
    counters: Arc<Counters>,
) -> Result<ResolvedAsset, AssetError> {
    let result = async {
        let fetched = {
            let _permit = slots.acquire().await.map_err(|_| AssetError::TransientIo {
                reference: reference.clone(),
                attempts: 0,
                message: "download pool closed".to_string(),
            })?;
            fetch_with_retry(&reference, fetcher.as_ref(), &settings).await?
        };
        counters.downloads.fetch_add(1, Ordering::Relaxed);

        let format = detect_format(&fetched.bytes, fetched.content_type.as_deref(), &reference);
        let original_len = fetched.bytes.len();
        let optimised = optimise(fetched.bytes, format, &settings.optimise).await;

        let store_failed = |e: crate::error::CacheError| AssetError::PersistentContent {
            reference: reference.clone(),
            message: format!("cache write failed: {e}"),
        };
        let stored = cache
            .store_bytes(&optimised.bytes, format.extension())
            .map_err(store_failed)?;
        let entry = cache
            .set(
                &reference,
                &stored.path,
                AssetMeta {
                    content_hash: stored.content_hash.clone(),
                },
            )
            .map_err(store_failed)?;

        counters
            .bytes_saved
            .fetch_add(optimised.bytes_saved, Ordering::Relaxed);
        info!(
            reference = %reference,
            filename = %entry.local_filename,
            format = ?format,
            original_bytes = original_len,
            stored_bytes = optimised.bytes.len(),
            bytes_saved = optimised.bytes_saved,
            deduplicated = !stored.newly_written,
            "[ASSET] Asset downloaded"
        );

        Ok(ResolvedAsset {
            local_reference: local_reference(&settings, &entry.local_filename),
            filename: entry.local_filename,
            bytes_saved: optimised.bytes_saved,
            cache_hit: false,
        })
    }
    .await;

    if result.is_err() {
        counters.failures.fetch_add(1, Ordering::Relaxed);
    }
    result
}

/// [`Fetcher`] over HTTP(S).
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("asset-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedAsset, FetchError> {
        let response = self.client.get(url).send().await.map_err(classify_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(classify_reqwest)?;
        Ok(FetchedAsset {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

/// 408, 429 and 5xx are worth retrying; every other failure status is final.
pub fn classify_status(status: StatusCode) -> FetchError {
    let message = format!("HTTP {status}");
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        FetchError::Transient(message)
    } else {
        FetchError::Permanent(message)
    }
}

fn classify_reqwest(err: reqwest::Error) -> FetchError {
    if let Some(status) = err.status() {
        return classify_status(status);
    }
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        FetchError::Transient(err.to_string())
    } else {
        FetchError::Permanent(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ResolverSettings {
        ResolverSettings {
            allowed_hosts: vec!["files.example.com".to_string()],
            backoff_base: Duration::from_millis(100),
            backoff_jitter: Duration::ZERO,
            ..ResolverSettings::default()
        }
    }

    #[test]
    fn validation_rejects_bad_scheme_host_and_garbage() {
        let s = settings();
        assert!(validate_reference("https://files.example.com/a.png", &s).is_ok());
        assert!(validate_reference("https://cdn.files.example.com/a.png", &s).is_ok());

        for bad in [
            "ftp://files.example.com/a.png",
            "https://evil.test/a.png",
            "https://notfiles.example.com.evil.test/a.png",
            "not a url",
            "file:///etc/passwd",
        ] {
            let err = validate_reference(bad, &s).unwrap_err();
            assert_eq!(err.kind(), "validation", "{bad} should fail validation");
        }
    }

    #[test]
    fn empty_host_list_allows_any_host() {
        let s = ResolverSettings::default();
        assert!(validate_reference("http://anything.test/x", &s).is_ok());
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let s = settings();
        assert_eq!(backoff_delay(&s, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&s, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&s, 4), Duration::from_millis(800));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let s = ResolverSettings {
            backoff_jitter: Duration::from_millis(50),
            ..settings()
        };
        for _ in 0..20 {
            let d = backoff_delay(&s, 1);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn status_classification() {
        assert!(matches!(classify_status(StatusCode::SERVICE_UNAVAILABLE), FetchError::Transient(_)));
        assert!(matches!(classify_status(StatusCode::TOO_MANY_REQUESTS), FetchError::Transient(_)));
        assert!(matches!(classify_status(StatusCode::REQUEST_TIMEOUT), FetchError::Transient(_)));
        assert!(matches!(classify_status(StatusCode::NOT_FOUND), FetchError::Permanent(_)));
        assert!(matches!(classify_status(StatusCode::FORBIDDEN), FetchError::Permanent(_)));
    }
}

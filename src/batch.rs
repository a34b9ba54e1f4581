//! Windowed, bounded-concurrency batch runner.
//!
//! Items are split into consecutive windows of `max_concurrent`. Every item
//! of a window runs as its own task and the whole window is awaited before
//! the next one starts. A per-item timeout only stops the executor from
//! waiting: the task itself keeps running detached, so work handed to the
//! executor must be safe to abandon.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::progress::ProgressTracker;

/// How one item ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement<R, E> {
    Fulfilled(R),
    Rejected(E),
    /// Abandoned after the per-item timeout. The task may still complete later.
    TimedOut,
    Panicked(String),
}

impl<R, E> Settlement<R, E> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Settlement::Fulfilled(_))
    }

    pub fn fulfilled(self) -> Option<R> {
        match self {
            Settlement::Fulfilled(r) => Some(r),
            _ => None,
        }
    }
}

pub type SettleCallback<R, E> = Arc<dyn Fn(usize, &Settlement<R, E>) + Send + Sync>;

pub struct BatchOptions<R, E> {
    pub max_concurrent: usize,
    pub per_item_timeout: Option<Duration>,
    /// Called once per item with its index in the input.
    pub on_settled: Option<SettleCallback<R, E>>,
    pub progress: Option<Arc<ProgressTracker>>,
}

impl<R, E> BatchOptions<R, E> {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            per_item_timeout: None,
            on_settled: None,
            progress: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_item_timeout = Some(timeout);
        self
    }

    pub fn on_settled(mut self, callback: impl Fn(usize, &Settlement<R, E>) + Send + Sync + 'static) -> Self {
        self.on_settled = Some(Arc::new(callback));
        self
    }

    pub fn with_progress(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = Some(progress);
        self
    }
}

struct Reporter<R, E> {
    on_settled: Option<SettleCallback<R, E>>,
    progress: Option<Arc<ProgressTracker>>,
}

impl<R, E> Reporter<R, E> {
    fn report(&self, index: usize, settlement: &Settlement<R, E>) {
        if let Some(progress) = &self.progress {
            progress.complete_item(settlement.is_fulfilled());
        }
        if let Some(callback) = &self.on_settled {
            callback(index, settlement);
        }
    }
}

/// First-writer-wins guard: whichever of the task or the timeout claims
/// first reports the item.
#[derive(Default)]
struct SettleSlot(AtomicBool);

impl SettleSlot {
    fn claim(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

pub struct BatchExecutor;

impl BatchExecutor {
    /// Runs `f` over every item. Settlements come back in input order; one
    /// item's failure never affects another.
    pub async fn process<T, R, E, F, Fut>(
        items: Vec<T>,
        f: F,
        options: BatchOptions<R, E>,
    ) -> Vec<Settlement<R, E>>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let total = items.len();
        let window_size = options.max_concurrent.max(1);
        let per_item_timeout = options.per_item_timeout;
        let reporter = Arc::new(Reporter {
            on_settled: options.on_settled,
            progress: options.progress,
        });
        info!(total, window_size, timeout_ms = per_item_timeout.map(|d| d.as_millis() as u64), "[BATCH] Starting batch");

        let mut results = Vec::with_capacity(total);
        let mut remaining = items.into_iter().enumerate().peekable();
        let mut window_index = 0usize;

        while remaining.peek().is_some() {
            let window: Vec<(usize, T)> = remaining.by_ref().take(window_size).collect();
            debug!(window = window_index, size = window.len(), "[BATCH] Window started");

            let waiters = window.into_iter().map(|(index, item)| {
                let slot = Arc::new(SettleSlot::default());
                if let Some(progress) = &reporter.progress {
                    progress.start_item();
                }

                let fut = f(item);
                let task_slot = slot.clone();
                let task_reporter = reporter.clone();
                let mut handle = tokio::spawn(async move {
                    let settlement = match fut.await {
                        Ok(r) => Settlement::Fulfilled(r),
                        Err(e) => Settlement::Rejected(e),
                    };
                    if task_slot.claim() {
                        task_reporter.report(index, &settlement);
                    } else {
                        debug!(index, "[BATCH] Late completion after timeout ignored");
                    }
                    settlement
                });

                let deadline = per_item_timeout.map(|d| Instant::now() + d);
                let reporter = reporter.clone();
                async move {
                    let joined = match deadline {
                        Some(deadline) => match tokio::time::timeout_at(deadline, &mut handle).await {
                            Ok(joined) => joined,
                            Err(_) => {
                                if slot.claim() {
                                    warn!(index, "[BATCH] Item timed out, abandoning");
                                    let settlement = Settlement::TimedOut;
                                    reporter.report(index, &settlement);
                                    return settlement;
                                }
                                // the task claimed first and is about to return
                                handle.await
                            }
                        },
                        None => handle.await,
                    };
                    match joined {
                        Ok(settlement) => settlement,
                        Err(join_error) => {
                            let message = join_error.to_string();
                            warn!(index, error = %message, "[BATCH] Item task panicked");
                            let settlement = Settlement::Panicked(message);
                            if slot.claim() {
                                reporter.report(index, &settlement);
                            }
                            settlement
                        }
                    }
                }
            });

            results.extend(join_all(waiters.collect::<Vec<_>>()).await);
            window_index += 1;
        }

        let fulfilled = results.iter().filter(|s| s.is_fulfilled()).count();
        info!(total, fulfilled, failed = total - fulfilled, "[BATCH] Batch complete");
        results
    }
}

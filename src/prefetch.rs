//! In-memory prefetch layer.
//!
//! Holds already-fetched raw values keyed by [`CacheKey`] (item id plus
//! modification stamp), so several output variants of the same item share
//! one upstream fetch. Bounded LRU: every read promotes the entry, the
//! least recently used entry is evicted first. Concurrent requests for the
//! same key await a single in-flight fetch.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::contract::SourceItem;
use crate::error::SourceError;

/// Identifies one version of one item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub item_id: String,
    pub last_modified: DateTime<Utc>,
}

impl CacheKey {
    pub fn new(item_id: impl Into<String>, last_modified: DateTime<Utc>) -> Self {
        Self {
            item_id: item_id.into(),
            last_modified,
        }
    }

    pub fn for_item(item: &SourceItem) -> Self {
        Self::new(item.id.clone(), item.last_modified)
    }
}

struct LruState<T> {
    entries: HashMap<CacheKey, (T, u64)>,
    order: BTreeMap<u64, CacheKey>,
    tick: u64,
}

impl<T> LruState<T> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

type InFlight<T, E> = Shared<BoxFuture<'static, Result<T, Arc<E>>>>;

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchStats {
    pub hits: u64,
    pub misses: u64,
}

pub struct PrefetchCache<T, E = SourceError> {
    capacity: usize,
    state: Mutex<LruState<T>>,
    in_flight: Mutex<HashMap<CacheKey, InFlight<T, E>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T, E> PrefetchCache<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LruState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                tick: 0,
            }),
            in_flight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the cached value and promotes it to most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<T> {
        let found = self.lookup(key);
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    fn lookup(&self, key: &CacheKey) -> Option<T> {
        let mut state = self.lock_state();
        let tick = state.next_tick();
        let (value, old_tick) = match state.entries.get_mut(key) {
            Some((value, entry_tick)) => {
                let old = *entry_tick;
                *entry_tick = tick;
                (value.clone(), old)
            }
            None => return None,
        };
        state.order.remove(&old_tick);
        state.order.insert(tick, key.clone());
        Some(value)
    }

    pub fn insert(&self, key: CacheKey, value: T) {
        if self.capacity == 0 {
            return;
        }
        let mut state = self.lock_state();
        let tick = state.next_tick();
        if let Some((_, old_tick)) = state.entries.insert(key.clone(), (value, tick)) {
            state.order.remove(&old_tick);
        }
        state.order.insert(tick, key);

        while state.entries.len() > self.capacity {
            let Some((_, oldest)) = state.order.pop_first() else {
                break;
            };
            state.entries.remove(&oldest);
            debug!(item_id = %oldest.item_id, "[PREFETCH] Evicted least recently used entry");
        }
    }

    /// Returns the cached value, or runs `fetch` once for all concurrent
    /// callers of the same key. Failures are shared with the waiters but not cached.
    pub async fn get_or_fetch<F, Fut>(&self, key: CacheKey, fetch: F) -> Result<T, Arc<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let shared = {
            let mut in_flight = self.lock_in_flight();
            match in_flight.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    // a fetch may have completed between the miss and the lock
                    if let Some(value) = self.lookup(&key) {
                        return Ok(value);
                    }
                    let fut = fetch().map(|r| r.map_err(Arc::new)).boxed().shared();
                    in_flight.insert(key.clone(), fut.clone());
                    fut
                }
            }
        };

        let result = shared.clone().await;
        if let Ok(value) = &result {
            self.insert(key.clone(), value.clone());
        }
        let mut in_flight = self.lock_in_flight();
        if in_flight.get(&key).is_some_and(|current| current.ptr_eq(&shared)) {
            in_flight.remove(&key);
        }
        drop(in_flight);
        result
    }

    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PrefetchStats {
        PrefetchStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Drops every entry; used between logical runs.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        state.entries.clear();
        state.order.clear();
    }

    fn lock_state(&self) -> MutexGuard<'_, LruState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<CacheKey, InFlight<T, E>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

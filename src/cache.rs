//! Peer-local blob cache with single-flight loads
//!
//! [CacheGroup::get] answers from memory when it can. On a miss the first
//! caller starts the load and registers it in the in-flight map; callers
//! arriving while it runs wait on the same shared future instead of
//! fetching again. Failed loads are not stored.
//!
//! Memory is bounded by a byte budget, entries are evicted least recently
//! used first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use lru::LruCache;
use serde::Serialize;

use crate::errors::FetchError;
use crate::origin::Fetcher;

/// 512 MiB
pub const DEFAULT_CACHE_BYTES: usize = 512 << 20;

type Flight = Shared<BoxFuture<'static, Result<Bytes, FetchError>>>;

/// Point-in-time counters of a [CacheGroup]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Calls made to the [Fetcher]
    pub loads: u64,
    /// Callers that waited on someone else's load
    pub dedup_waiters: u64,
    pub evictions: u64,
    pub bytes: usize,
    pub entries: usize,
}

struct Store {
    entries: LruCache<String, Bytes>,
    bytes: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    dedup_waiters: AtomicU64,
    evictions: AtomicU64,
}

struct GroupInner {
    max_bytes: usize,
    store: Mutex<Store>,
    in_flight: DashMap<String, Flight>,
    fetcher: Arc<dyn Fetcher>,
    counters: Counters,
}

fn entry_size(key: &str, value: &Bytes) -> usize {
    key.len() + value.len()
}

impl GroupInner {
    fn store(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, key: &str) -> Option<Bytes> {
        self.store().entries.get(key).cloned()
    }

    fn insert(&self, key: &str, value: Bytes) {
        let size = entry_size(key, &value);
        if size > self.max_bytes {
            warn!(key:% = key, size:% = size; "Entry larger than the cache budget, not stored");
            return;
        }

        let mut store = self.store();
        if let Some(previous) = store.entries.put(key.to_string(), value) {
            store.bytes = store.bytes.saturating_sub(entry_size(key, &previous));
        }
        store.bytes += size;

        while store.bytes > self.max_bytes {
            let Some((evicted_key, evicted)) = store.entries.pop_lru() else {
                break;
            };
            store.bytes = store.bytes.saturating_sub(entry_size(&evicted_key, &evicted));
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key:% = evicted_key; "Evicted");
        }
    }

    async fn load(self: Arc<Self>, key: String) -> Result<Bytes, FetchError> {
        // another flight may have filled the entry between our miss and now
        let result = match self.lookup(&key) {
            Some(hit) => Ok(hit),
            None => {
                self.counters.loads.fetch_add(1, Ordering::Relaxed);
                self.fetcher.fetch(&key).await
            }
        };
        if let Ok(value) = &result {
            self.insert(&key, value.clone());
        }
        self.in_flight.remove(&key);
        result
    }
}

/// Byte-bounded, single-flight cache in front of a [Fetcher]
#[derive(Clone)]
pub struct CacheGroup {
    inner: Arc<GroupInner>,
}

impl CacheGroup {
    /// `max_bytes` counts keys and values
    pub fn new(max_bytes: usize, fetcher: Arc<dyn Fetcher>) -> CacheGroup {
        CacheGroup {
            inner: Arc::new(GroupInner {
                max_bytes,
                store: Mutex::new(Store {
                    entries: LruCache::unbounded(),
                    bytes: 0,
                }),
                in_flight: DashMap::new(),
                fetcher,
                counters: Counters::default(),
            }),
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.inner.max_bytes
    }

    /// Blob stored under `key`, loading it on a miss
    pub async fn get(&self, key: &str) -> Result<Bytes, FetchError> {
        if let Some(hit) = self.inner.lookup(key) {
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }

        // the shard lock is released before waiting
        let (flight, leader) = match self.inner.in_flight.entry(key.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let flight = self
                    .inner
                    .clone()
                    .load(key.to_string())
                    .boxed()
                    .shared();
                entry.insert(flight.clone());
                (flight, true)
            }
        };

        if leader {
            self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner
                .counters
                .dedup_waiters
                .fetch_add(1, Ordering::Relaxed);
        }
        flight.await
    }

    /// Cached blob, without loading or touching the recency order
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        self.inner.store().entries.peek(key).cloned()
    }

    pub fn stats(&self) -> CacheStats {
        let (bytes, entries) = {
            let store = self.inner.store();
            (store.bytes, store.entries.len())
        };
        let counters = &self.inner.counters;
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            loads: counters.loads.load(Ordering::Relaxed),
            dedup_waiters: counters.dedup_waiters.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            bytes,
            entries,
        }
    }
}

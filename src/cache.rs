//! Explicit cache client for thresholds, distributions and segment tables.
//!
//! Every call is best-effort: a backend failure is logged and reported as a
//! miss (reads) or `false` (writes), never as an error. Callers fall back to
//! the statistics store.
//!
//! Read-through fills are guarded by a per-key generation so a reader that
//! fetched from the store before an invalidation cannot put its stale value
//! back afterwards.
//!
//! The per-key confirm tokens also live here.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use moka::future::Cache as MokaCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::models::{GradeDistribution, GradeThresholds, SegmentTable, ThresholdKey};

const THRESHOLDS: &str = "thresholds";
const DISTRIBUTION: &str = "distribution";
const SEGMENTS: &str = "segments";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Byte-level key-value storage behind `GradeCache`.
///
/// Uses boxed futures so the client can hold an `Arc<dyn CacheBackend>`.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>, CacheError>>;

    fn set(&self, key: &str, value: Vec<u8>) -> BoxFuture<'_, Result<(), CacheError>>;

    /// `Ok(true)` if the key existed.
    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool, CacheError>>;
}

/// In-process backend on moka with a fixed time-to-live.
pub struct MemoryCacheBackend {
    cache: MokaCache<String, Vec<u8>>,
}

impl MemoryCacheBackend {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = MokaCache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }
}

impl CacheBackend for MemoryCacheBackend {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>, CacheError>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.cache.get(&key).await) })
    }

    fn set(&self, key: &str, value: Vec<u8>) -> BoxFuture<'_, Result<(), CacheError>> {
        let key = key.to_string();
        Box::pin(async move {
            self.cache.insert(key, value).await;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool, CacheError>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.cache.remove(&key).await.is_some()) })
    }
}

/// Typed, best-effort cache client handed to the coordinator.
#[derive(Clone)]
pub struct GradeCache {
    backend: Arc<dyn CacheBackend>,
    generations: Arc<DashMap<ThresholdKey, u64>>,
}

impl GradeCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            generations: Arc::new(DashMap::new()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(Arc::new(MemoryCacheBackend::new(
            config.max_entries,
            config.ttl(),
        )))
    }

    pub async fn thresholds(&self, key: &ThresholdKey) -> Option<GradeThresholds> {
        self.read(key, THRESHOLDS).await
    }

    pub async fn store_thresholds(&self, thresholds: &GradeThresholds) -> bool {
        self.write(&thresholds.key, THRESHOLDS, thresholds).await
    }

    /// Caches thresholds read from the store at `seen`, unless the key has
    /// been invalidated since.
    pub async fn fill_thresholds(&self, thresholds: &GradeThresholds, seen: u64) -> bool {
        self.fill(&thresholds.key, THRESHOLDS, thresholds, seen).await
    }

    pub async fn distribution(&self, key: &ThresholdKey) -> Option<GradeDistribution> {
        self.read(key, DISTRIBUTION).await
    }

    pub async fn store_distribution(&self, distribution: &GradeDistribution) -> bool {
        self.write(&distribution.key, DISTRIBUTION, distribution).await
    }

    pub async fn fill_distribution(&self, distribution: &GradeDistribution, seen: u64) -> bool {
        self.fill(&distribution.key, DISTRIBUTION, distribution, seen).await
    }

    pub async fn segments(&self, key: &ThresholdKey) -> Option<SegmentTable> {
        self.read(key, SEGMENTS).await
    }

    pub async fn store_segments(&self, segments: &SegmentTable) -> bool {
        self.write(&segments.key, SEGMENTS, segments).await
    }

    pub async fn fill_segments(&self, segments: &SegmentTable, seen: u64) -> bool {
        self.fill(&segments.key, SEGMENTS, segments, seen).await
    }

    /// Take this before reading from the store and pass it to a `fill_*`.
    pub fn generation(&self, key: &ThresholdKey) -> u64 {
        self.generations.get(key).map_or(0, |generation| *generation)
    }

    /// Drops every cached artifact for `key`. Returns false if any delete
    /// failed.
    pub async fn invalidate(&self, key: &ThresholdKey) -> bool {
        *self.generations.entry(key.clone()).or_insert(0) += 1;
        let mut clean = true;
        for kind in [THRESHOLDS, DISTRIBUTION, SEGMENTS] {
            let cache_key = key.cache_key(kind);
            if let Err(e) = self.backend.delete(&cache_key).await {
                error!(key = %cache_key, error = %e, "Cache invalidation failed");
                clean = false;
            }
        }
        clean
    }

    async fn read<T: DeserializeOwned>(&self, key: &ThresholdKey, kind: &str) -> Option<T> {
        let cache_key = key.cache_key(kind);
        match self.backend.get(&cache_key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key = %cache_key, error = %e, "Discarding unreadable cache entry");
                    None
                }
            },
            Ok(None) => {
                debug!(key = %cache_key, "Cache miss");
                None
            }
            Err(e) => {
                warn!(key = %cache_key, error = %e, "Cache read failed");
                None
            }
        }
    }

    async fn fill<T: Serialize>(
        &self,
        key: &ThresholdKey,
        kind: &str,
        value: &T,
        seen: u64,
    ) -> bool {
        if self.generation(key) != seen {
            debug!(key = %key.cache_key(kind), "Skipping fill from a superseded read");
            return false;
        }
        if !self.write(key, kind, value).await {
            return false;
        }
        // An invalidation landed while the write was in flight.
        if self.generation(key) != seen {
            let cache_key = key.cache_key(kind);
            if let Err(e) = self.backend.delete(&cache_key).await {
                error!(key = %cache_key, error = %e, "Could not drop superseded cache entry");
            }
            return false;
        }
        true
    }

    async fn write<T: Serialize>(&self, key: &ThresholdKey, kind: &str, value: &T) -> bool {
        let cache_key = key.cache_key(kind);
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %cache_key, error = %e, "Cache entry could not be encoded");
                return false;
            }
        };
        match self.backend.set(&cache_key, bytes).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %cache_key, error = %e, "Cache write failed");
                false
            }
        }
    }
}

/// Short-lived per-key tokens admitting at most one confirm per key.
///
/// A token older than `ttl` is treated as abandoned and may be taken over.
pub struct ConfirmLocks {
    held: DashMap<ThresholdKey, (Uuid, Instant)>,
    ttl: Duration,
}

impl ConfirmLocks {
    pub fn new(ttl: Duration) -> Self {
        Self {
            held: DashMap::new(),
            ttl,
        }
    }

    /// `None` while another live token holds `key`.
    pub fn try_acquire(&self, key: &ThresholdKey) -> Option<ConfirmGuard<'_>> {
        let token = Uuid::new_v4();
        let now = Instant::now();
        match self.held.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let (_, acquired_at) = *entry.get();
                if now.duration_since(acquired_at) < self.ttl {
                    return None;
                }
                warn!(key = %key, "Taking over expired confirm token");
                entry.insert((token, now));
            }
            Entry::Vacant(entry) => {
                entry.insert((token, now));
            }
        }
        Some(ConfirmGuard {
            locks: self,
            key: key.clone(),
            token,
        })
    }

    #[cfg(test)]
    pub fn is_held(&self, key: &ThresholdKey) -> bool {
        self.held.contains_key(key)
    }
}

/// Releases its token on drop, unless it has since been taken over.
pub struct ConfirmGuard<'a> {
    locks: &'a ConfirmLocks,
    key: ThresholdKey,
    token: Uuid,
}

impl Drop for ConfirmGuard<'_> {
    fn drop(&mut self) {
        self.locks
            .held
            .remove_if(&self.key, |_, (token, _)| *token == self.token);
    }
}

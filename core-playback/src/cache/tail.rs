//! Cross-resource cache of final chunks.
//!
//! Bounded by total memory, not entry count. One instance is shared by every
//! orchestrator that should reuse tails; tests simply build a fresh one.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use core_runtime::events::{CacheEvent, CoreEvent, EventBus};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::coordinator::PlaybackCoordinator;

/// The final chunks of one resource.
#[derive(Debug, Clone)]
pub struct TailEntry {
    pub resource_id: String,
    pub url: String,
    pub total_size: u64,
    /// Chunk size the indices in `chunks` were computed with.
    pub chunk_size: usize,
    pub chunks: BTreeMap<usize, Bytes>,
    pub cached_at: DateTime<Utc>,
    pub memory_size: u64,
}

impl TailEntry {
    fn matches(&self, url: &str, total_size: u64, chunk_size: usize) -> bool {
        self.url == url && self.total_size == total_size && self.chunk_size == chunk_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TailCacheStats {
    pub entries: usize,
    pub memory_bytes: u64,
    pub ceiling_bytes: u64,
}

impl TailCacheStats {
    pub fn usage_percentage(&self) -> f64 {
        if self.ceiling_bytes == 0 {
            return 0.0;
        }
        (self.memory_bytes as f64 / self.ceiling_bytes as f64) * 100.0
    }

    pub fn is_near_capacity(&self) -> bool {
        self.usage_percentage() >= 90.0
    }
}

struct TailInner {
    entries: LruCache<String, Arc<TailEntry>>,
    memory_bytes: u64,
}

pub struct TailCache {
    inner: Mutex<TailInner>,
    ceiling: u64,
    event_bus: Option<Arc<EventBus>>,
}

impl TailCache {
    /// 1 GiB.
    pub const DEFAULT_CEILING: u64 = 1024 * 1024 * 1024;

    pub fn new(ceiling_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(TailInner {
                entries: LruCache::unbounded(),
                memory_bytes: 0,
            }),
            ceiling: ceiling_bytes,
            event_bus: None,
        }
    }

    /// Publish `TailEvicted` events on `event_bus`.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Look up a tail and mark it most recently used.
    ///
    /// An entry whose url, size or chunk geometry differs from the request
    /// is stale (urls rotate) and is removed.
    pub fn get(
        &self,
        resource_id: &str,
        url: &str,
        total_size: u64,
        chunk_size: usize,
    ) -> Option<Arc<TailEntry>> {
        let mut inner = self.inner.lock();
        let entry = Arc::clone(inner.entries.get(resource_id)?);

        if !entry.matches(url, total_size, chunk_size) {
            debug!(resource_id, "Tail entry stale, removing");
            inner.entries.pop(resource_id);
            inner.memory_bytes = inner.memory_bytes.saturating_sub(entry.memory_size);
            return None;
        }

        Some(entry)
    }

    /// Store `chunks` as the tail of `resource_id`, replacing any previous entry.
    ///
    /// Least recently used entries are evicted until memory is under the
    /// ceiling. Empty ids or chunk sets are ignored.
    pub fn put(
        &self,
        resource_id: &str,
        url: &str,
        total_size: u64,
        chunk_size: usize,
        chunks: BTreeMap<usize, Bytes>,
    ) -> Option<Arc<TailEntry>> {
        self.store(resource_id, url, total_size, chunk_size, chunks, true)
    }

    fn store(
        &self,
        resource_id: &str,
        url: &str,
        total_size: u64,
        chunk_size: usize,
        chunks: BTreeMap<usize, Bytes>,
        replace: bool,
    ) -> Option<Arc<TailEntry>> {
        if resource_id.is_empty() || chunks.is_empty() {
            return None;
        }

        let memory_size = chunks.values().map(|c| c.len() as u64).sum();
        let entry = Arc::new(TailEntry {
            resource_id: resource_id.to_string(),
            url: url.to_string(),
            total_size,
            chunk_size,
            chunks,
            cached_at: Utc::now(),
            memory_size,
        });

        let evicted = {
            let mut inner = self.inner.lock();
            if !replace {
                if let Some(existing) = inner.entries.get(resource_id) {
                    if existing.matches(url, total_size, chunk_size) {
                        return Some(Arc::clone(existing));
                    }
                }
            }
            if let Some(previous) = inner.entries.put(resource_id.to_string(), Arc::clone(&entry)) {
                inner.memory_bytes = inner.memory_bytes.saturating_sub(previous.memory_size);
            }
            inner.memory_bytes += memory_size;

            let mut evicted = Vec::new();
            while inner.memory_bytes > self.ceiling {
                let Some((_, victim)) = inner.entries.pop_lru() else {
                    break;
                };
                inner.memory_bytes = inner.memory_bytes.saturating_sub(victim.memory_size);
                evicted.push(victim);
            }
            evicted
        };

        for victim in evicted {
            debug!(
                resource_id = %victim.resource_id,
                memory_bytes = victim.memory_size,
                "Tail entry evicted"
            );
            if let Some(bus) = &self.event_bus {
                let _ = bus.emit(CoreEvent::Cache(CacheEvent::TailEvicted {
                    resource_id: victim.resource_id.clone(),
                    memory_bytes: victim.memory_size,
                }));
            }
        }

        Some(entry)
    }

    pub fn remove(&self, resource_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.pop(resource_id) {
            Some(entry) => {
                inner.memory_bytes = inner.memory_bytes.saturating_sub(entry.memory_size);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, resource_id: &str) -> bool {
        self.inner.lock().entries.contains(resource_id)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.memory_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_usage(&self) -> u64 {
        self.inner.lock().memory_bytes
    }

    pub fn stats(&self) -> TailCacheStats {
        let inner = self.inner.lock();
        TailCacheStats {
            entries: inner.entries.len(),
            memory_bytes: inner.memory_bytes,
            ceiling_bytes: self.ceiling,
        }
    }

    /// Return the cached tail of the coordinator's resource, fetching the
    /// last `chunk_count` chunks first if there is none.
    ///
    /// Fetches go through the coordinator so they share its worker permits
    /// and never race a scheduled fetch of the same chunk.
    /// `None` if cancelled or nothing could be fetched.
    pub async fn warm(
        &self,
        resource_id: &str,
        coordinator: &PlaybackCoordinator,
        chunk_count: usize,
        cancel: &CancellationToken,
    ) -> Option<Arc<TailEntry>> {
        let descriptor = coordinator.descriptor();
        let (url, total_size, chunk_size) =
            (descriptor.url(), descriptor.total_size(), descriptor.chunk_size());
        if let Some(hit) = self.get(resource_id, url, total_size, chunk_size) {
            return Some(hit);
        }

        let total = descriptor.total_chunks();
        let first = total.saturating_sub(chunk_count.max(1));
        let mut chunks = BTreeMap::new();

        for index in first..total {
            match coordinator.fetch_urgent_chunk(index, cancel).await {
                Some(data) => {
                    chunks.insert(index, data);
                }
                None if cancel.is_cancelled() => return None,
                None => warn!(resource_id, chunk = index, "Tail chunk unavailable"),
            }
        }

        // A complete tail may have landed while fetching; keep it.
        self.store(resource_id, url, total_size, chunk_size, chunks, false)
    }
}

impl Default for TailCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CEILING)
    }
}

impl std::fmt::Debug for TailCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailCache")
            .field("stats", &self.stats())
            .finish()
    }
}

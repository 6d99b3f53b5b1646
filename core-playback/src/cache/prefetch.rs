//! Predictive prefetch of likely seek targets.
//!
//! Segments at fixed fractions of the resource are downloaded one after the
//! other over a single connection each. Running them concurrently triggers
//! server-side rate limiting, so the path stays serial.

use bytes::Bytes;
use core_runtime::events::{CoreEvent, EventBus, PrefetchEvent};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::bandwidth::{BandwidthAllocator, ConnectionClass};
use super::fetcher::RangeFetcher;
use crate::config::PrefetchConfig;

/// Tolerance when looking a segment up by ratio.
const RATIO_TOLERANCE: f64 = 0.05;

/// A block of chunks downloaded speculatively at one offset.
#[derive(Debug)]
pub struct PrefetchSegment {
    start_ratio: f64,
    start_offset: u64,
    start_chunk: usize,
    chunks: DashMap<usize, Bytes>,
    active: AtomicBool,
    cancel: CancellationToken,
}

impl PrefetchSegment {
    fn new(start_ratio: f64, start_offset: u64, start_chunk: usize, cancel: CancellationToken) -> Self {
        Self {
            start_ratio,
            start_offset,
            start_chunk,
            chunks: DashMap::new(),
            active: AtomicBool::new(true),
            cancel,
        }
    }

    pub fn start_ratio(&self) -> f64 {
        self.start_ratio
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn start_chunk(&self) -> usize {
        self.start_chunk
    }

    /// Still downloading.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn cached_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.value().len() as u64).sum()
    }

    /// Copy of the downloaded chunks, in no particular order.
    pub fn chunks(&self) -> Vec<(usize, Bytes)> {
        self.chunks
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Whether `index` lies in the downloaded run and is present.
    ///
    /// Active segments qualify: a partial hit is still a hit.
    fn covers(&self, index: usize, min_chunks: usize) -> bool {
        let count = self.chunks.len();
        count >= min_chunks
            && index >= self.start_chunk
            && index < self.start_chunk + count
            && self.chunks.contains_key(&index)
    }

    fn stop(&self) {
        self.cancel.cancel();
        self.active.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PrefetchStats {
    pub segments: usize,
    pub active_segments: usize,
    pub cached_chunks: usize,
    pub cached_bytes: u64,
}

pub struct PredictivePrefetcher {
    resource_id: String,
    config: PrefetchConfig,
    fetcher: RangeFetcher,
    bandwidth: Arc<BandwidthAllocator>,
    segments: Mutex<Vec<Arc<PrefetchSegment>>>,
    cancel: CancellationToken,
    slot_poll_interval: Duration,
    event_bus: Option<Arc<EventBus>>,
}

impl PredictivePrefetcher {
    pub fn new(
        resource_id: impl Into<String>,
        config: PrefetchConfig,
        fetcher: RangeFetcher,
        bandwidth: Arc<BandwidthAllocator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            config,
            fetcher,
            bandwidth,
            segments: Mutex::new(Vec::new()),
            cancel,
            slot_poll_interval: Duration::from_millis(250),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Option<Arc<EventBus>>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// How often a refused precache slot is asked for again.
    pub fn with_slot_poll_interval(mut self, interval: Duration) -> Self {
        self.slot_poll_interval = interval;
        self
    }

    /// Download every configured segment, one at a time.
    ///
    /// Returns the number of segments that finished without being stopped.
    #[instrument(skip(self), fields(resource_id = %self.resource_id))]
    pub async fn run(&self) -> usize {
        let descriptor = Arc::clone(self.fetcher.descriptor());
        let mut completed = 0;

        for &ratio in &self.config.ratios {
            if self.cancel.is_cancelled() {
                break;
            }

            // Chunk-aligned so segment chunks line up with the store's.
            let start_chunk = descriptor.chunk_for((descriptor.total_size() as f64 * ratio) as u64);
            let segment = Arc::new(PrefetchSegment::new(
                ratio,
                descriptor.chunk_start(start_chunk),
                start_chunk,
                self.cancel.child_token(),
            ));
            self.segments.lock().push(Arc::clone(&segment));

            let Some(slot) = self.acquire_slot(&segment.cancel).await else {
                segment.stop();
                self.emit(PrefetchEvent::SegmentStopped {
                    resource_id: self.resource_id.clone(),
                    ratio_percent: ratio_percent(ratio),
                });
                continue;
            };

            self.emit(PrefetchEvent::SegmentStarted {
                resource_id: self.resource_id.clone(),
                ratio_percent: ratio_percent(ratio),
                start_chunk: start_chunk as u64,
            });
            debug!(ratio, start_chunk, slot, "Prefetch segment started");

            let result = self
                .fetcher
                .fetch_span(
                    start_chunk,
                    self.config.chunks_per_segment,
                    |index, data| {
                        if descriptor.expected_len(index) == Some(data.len()) {
                            self.bandwidth
                                .record_transfer(ConnectionClass::PreCache, data.len() as u64);
                            segment.chunks.insert(index, data);
                        }
                        ControlFlow::Continue(())
                    },
                    &segment.cancel,
                )
                .await;

            self.bandwidth.deactivate_pre_cache(slot);
            segment.active.store(false, Ordering::Release);

            match result {
                Err(e) if e.is_cancelled() => {
                    debug!(ratio, chunks = segment.chunk_count(), "Prefetch segment stopped");
                    self.emit(PrefetchEvent::SegmentStopped {
                        resource_id: self.resource_id.clone(),
                        ratio_percent: ratio_percent(ratio),
                    });
                }
                outcome => {
                    if let Err(e) = outcome {
                        warn!(ratio, chunks = segment.chunk_count(), error = %e, "Prefetch segment incomplete");
                    } else {
                        completed += 1;
                    }
                    self.emit(PrefetchEvent::SegmentCompleted {
                        resource_id: self.resource_id.clone(),
                        ratio_percent: ratio_percent(ratio),
                        chunks: segment.chunk_count() as u64,
                    });
                }
            }
        }

        info!(completed, "Predictive prefetch finished");
        completed
    }

    async fn acquire_slot(&self, cancel: &CancellationToken) -> Option<usize> {
        loop {
            if let Some(slot) = self.bandwidth.activate_pre_cache() {
                return Some(slot);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.slot_poll_interval) => {}
            }
        }
    }

    /// Segment holding the chunk at `position`, if any.
    pub fn is_position_covered(&self, position: u64) -> Option<Arc<PrefetchSegment>> {
        let index = self.fetcher.descriptor().chunk_for(position);
        let min_chunks = self
            .config
            .min_chunks_for_hit
            .min(self.config.chunks_per_segment)
            .max(1);
        self.segments
            .lock()
            .iter()
            .find(|segment| segment.covers(index, min_chunks))
            .cloned()
    }

    /// Segment started near `ratio` (±0.05).
    pub fn segment_at(&self, ratio: f64) -> Option<Arc<PrefetchSegment>> {
        self.segments
            .lock()
            .iter()
            .find(|segment| (segment.start_ratio - ratio).abs() <= RATIO_TOLERANCE)
            .cloned()
    }

    /// Stop one segment; the others keep what they downloaded.
    pub fn stop_segment(&self, ratio: f64) -> bool {
        match self.segment_at(ratio) {
            Some(segment) => {
                segment.stop();
                true
            }
            None => false,
        }
    }

    /// Stop the current segment and skip the remaining ones.
    pub fn stop_all(&self) {
        self.cancel.cancel();
        for segment in self.segments.lock().iter() {
            segment.stop();
        }
    }

    /// Drop every segment and its chunks.
    pub fn clear(&self) {
        self.segments.lock().clear();
    }

    pub fn segments(&self) -> Vec<Arc<PrefetchSegment>> {
        self.segments.lock().clone()
    }

    pub fn stats(&self) -> PrefetchStats {
        let segments = self.segments.lock();
        PrefetchStats {
            segments: segments.len(),
            active_segments: segments.iter().filter(|s| s.is_active()).count(),
            cached_chunks: segments.iter().map(|s| s.chunk_count()).sum(),
            cached_bytes: segments.iter().map(|s| s.cached_bytes()).sum(),
        }
    }

    fn emit(&self, event: PrefetchEvent) {
        if let Some(bus) = &self.event_bus {
            let _ = bus.emit(CoreEvent::Prefetch(event));
        }
    }
}

impl std::fmt::Debug for PredictivePrefetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictivePrefetcher")
            .field("resource_id", &self.resource_id)
            .field("stats", &self.stats())
            .finish()
    }
}

fn ratio_percent(ratio: f64) -> u8 {
    (ratio * 100.0).round().clamp(0.0, 100.0) as u8
}

//! Playback-aware coordinator.
//!
//! Binds the hotspot tracker, the scheduler and the chunk store to one
//! playback session and runs the worker pool that drains the queue.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::bandwidth::{BandwidthAllocator, ConnectionClass};
use super::chunk::ResourceDescriptor;
use super::fetcher::RangeFetcher;
use super::hotspot::HotspotTracker;
use super::scheduler::PriorityScheduler;
use super::store::{ChunkSink, ChunkStore};
use crate::config::StreamCacheConfig;

/// The driver re-derives the window at least this often while idle.
const IDLE_REFRESH: Duration = Duration::from_millis(500);

pub struct PlaybackCoordinator {
    hotspot: Arc<HotspotTracker>,
    scheduler: Arc<PriorityScheduler>,
    store: Arc<ChunkStore>,
    fetcher: RangeFetcher,
    sink: Arc<dyn ChunkSink>,
    bandwidth: Arc<BandwidthAllocator>,
    permits: Arc<Semaphore>,
    wake: Notify,
    poll_interval: Duration,
    boost_radius: usize,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl PlaybackCoordinator {
    pub fn new(
        store: Arc<ChunkStore>,
        fetcher: RangeFetcher,
        sink: Arc<dyn ChunkSink>,
        bandwidth: Arc<BandwidthAllocator>,
        config: &StreamCacheConfig,
        cancel: CancellationToken,
    ) -> Self {
        let descriptor = Arc::clone(fetcher.descriptor());
        let hotspot = Arc::new(HotspotTracker::new(
            descriptor,
            config.behind_chunks,
            config.ahead_chunks,
        ));
        let scheduler = Arc::new(PriorityScheduler::new(
            Arc::clone(&store),
            config.behind_chunks,
            config.ahead_chunks,
            config.near_end_threshold,
        ));

        Self {
            hotspot,
            scheduler,
            store,
            fetcher,
            sink,
            bandwidth,
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            wake: Notify::new(),
            poll_interval: config.health_poll_interval,
            boost_radius: (config.ahead_chunks / 2).max(2),
            started: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn hotspot(&self) -> &Arc<HotspotTracker> {
        &self.hotspot
    }

    pub fn scheduler(&self) -> &Arc<PriorityScheduler> {
        &self.scheduler
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        self.store.descriptor()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    /// Start the background worker pool on `runtime`. Idempotent.
    pub fn start(self: &Arc<Self>, runtime: &Handle) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        runtime.spawn(async move { this.drive().await });
    }

    async fn drive(self: Arc<Self>) {
        debug!("Coordinator worker pool started");
        self.scheduler.update_window(self.hotspot.current_chunk());

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            while let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
                let Some(index) = self.scheduler.dequeue() else {
                    break;
                };
                self.spawn_worker(index, permit);
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(IDLE_REFRESH) => {
                    self.scheduler.update_window(self.hotspot.current_chunk());
                }
            }
        }

        self.scheduler.reset();
        debug!("Coordinator worker pool stopped");
    }

    fn spawn_worker(self: &Arc<Self>, index: usize, permit: OwnedSemaphorePermit) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            match this.fetcher.fetch_chunk(index, &this.cancel).await {
                Ok(data) => {
                    this.bandwidth
                        .record_transfer(ConnectionClass::MainPlayback, data.len() as u64);
                    if this.sink.accept(index, data) {
                        this.scheduler.mark_completed(index);
                    } else {
                        this.scheduler.mark_failed(index);
                    }
                }
                Err(e) if e.is_cancelled() => this.scheduler.mark_completed(index),
                Err(e) => {
                    warn!(chunk = index, error = %e, "Scheduled chunk fetch failed");
                    this.scheduler.mark_failed(index);
                }
            }
            this.wake.notify_one();
        });
    }

    /// Ordinary playback progression.
    pub fn update_position(&self, position: u64) {
        self.hotspot.set_position(position);
        self.scheduler.update_window(self.hotspot.current_chunk());
        self.wake.notify_one();
    }

    /// Jump to `position` and pull the chunks around it to the front.
    pub fn on_seek(&self, position: u64) {
        self.hotspot.shift_to(position);
        let current = self.hotspot.current_chunk();
        self.scheduler.update_window(current);
        self.scheduler.boost(current, self.boost_radius);
        trace!(position, current, "Coordinator seek");
        self.wake.notify_one();
    }

    /// Fetch `index` now, outside the queue, using one worker slot.
    ///
    /// If a worker already has the chunk in flight, waits for it instead.
    /// Returns whether the chunk is cached afterwards; `false` on cancellation.
    pub async fn request_urgent_chunk(&self, index: usize, cancel: &CancellationToken) -> bool {
        if self.store.contains(index) {
            return true;
        }
        if index >= self.store.descriptor().total_chunks() {
            return false;
        }
        if !self.scheduler.try_claim(index) {
            return self.wait_for_in_flight(index, cancel).await;
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = self.cancel.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            self.scheduler.mark_completed(index);
            return false;
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.fetcher.fetch_chunk(index, &self.cancel) => Some(result),
        };

        let stored = match result {
            Some(Ok(data)) => {
                self.bandwidth
                    .record_transfer(ConnectionClass::MainPlayback, data.len() as u64);
                self.sink.accept(index, data)
            }
            Some(Err(e)) if !e.is_cancelled() => {
                warn!(chunk = index, error = %e, "Urgent chunk fetch failed");
                false
            }
            _ => false,
        };

        self.scheduler.mark_completed(index);
        self.wake.notify_one();
        stored
    }

    /// [`Self::request_urgent_chunk`], returning the cached bytes.
    pub async fn fetch_urgent_chunk(&self, index: usize, cancel: &CancellationToken) -> Option<Bytes> {
        if self.request_urgent_chunk(index, cancel).await {
            self.store.get(index)
        } else {
            None
        }
    }

    async fn wait_for_in_flight(&self, index: usize, cancel: &CancellationToken) -> bool {
        loop {
            if self.store.contains(index) {
                return true;
            }
            if !self.scheduler.is_in_flight(index) {
                return self.store.contains(index);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for PlaybackCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackCoordinator")
            .field("current_chunk", &self.hotspot.current_chunk())
            .field("scheduler", &self.scheduler)
            .field("running", &self.is_running())
            .finish()
    }
}

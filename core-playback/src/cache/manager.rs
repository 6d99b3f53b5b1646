//! # Stream Cache Manager
//!
//! Top-level orchestrator for one remote resource.
//!
//! This module owns:
//! - Strategy selection (forced, remembered per host, or probed)
//! - Startup sequencing: chunk 0 first, tail in the background, then backfill
//! - The read, seek and health entry points used by the decoder
//! - The buffering state machine and progress reporting
//!
//! Every background task runs under one cancellation scope. Tasks hold the
//! components they need, never the manager, so dropping the last handle
//! cancels everything.

use bridge_traits::http::{HttpClient, RetryPolicy};
use bytes::Bytes;
use core_runtime::events::{CacheEvent, CoreEvent, EventBus};
use core_runtime::logging::redact_if_sensitive;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::bandwidth::BandwidthAllocator;
use super::chunk::ResourceDescriptor;
use super::coordinator::PlaybackCoordinator;
use super::fetcher::RangeFetcher;
use super::prefetch::PredictivePrefetcher;
use super::state::{BufferingState, BufferingStateMachine, CacheHealthInfo};
use super::stats::CacheStats;
use super::store::{ChunkSink, ChunkStore, InsertOutcome};
use super::strategy::{probe_range_support, select_strategy, DownloadStrategy, StrategyCache};
use super::tail::TailCache;
use crate::config::StreamCacheConfig;
use crate::error::{PlaybackError, Result};

// ============================================================================
// Chunk Intake
// ============================================================================

/// What "ready" means for the current session.
#[derive(Debug, Clone, Copy)]
struct ReadyRule {
    preload: bool,
    require_tail: bool,
    min_ready_chunks: usize,
}

impl ReadyRule {
    fn is_met(&self, store: &ChunkStore) -> bool {
        if !store.contains(0) {
            return false;
        }
        if self.preload {
            return true;
        }
        let total = store.descriptor().total_chunks();
        let head = store.contains_all(0, self.min_ready_chunks.min(total));
        head && (!self.require_tail || store.contains(total - 1))
    }
}

/// Single entry point through which every fetched chunk reaches the store.
struct ChunkIntake {
    resource_id: String,
    store: Arc<ChunkStore>,
    rule: Mutex<ReadyRule>,
    ready: watch::Sender<bool>,
    progress: watch::Sender<u8>,
    download_progress: Mutex<f64>,
    fully_cached: AtomicBool,
    tail_cache: Option<Arc<TailCache>>,
    tail_track_chunks: usize,
    event_bus: Option<Arc<EventBus>>,
    cancel: CancellationToken,
}

impl ChunkIntake {
    fn set_rule(&self, rule: ReadyRule) {
        *self.rule.lock() = rule;
        self.refresh();
    }

    fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    fn set_download_progress(&self, fraction: f64) {
        *self.download_progress.lock() = fraction.clamp(0.0, 1.0);
    }

    /// Re-evaluate readiness, progress and completion after the store changed.
    fn refresh(&self) {
        let rule = *self.rule.lock();
        let ready = rule.is_met(&self.store);
        self.ready.send_if_modified(|current| {
            let changed = *current != ready;
            *current = ready;
            changed
        });

        let total = self.store.descriptor().total_size();
        let percent = ((self.store.cached_bytes() * 100) / total).min(100) as u8;
        let progressed = self.progress.send_if_modified(|current| {
            let changed = *current != percent;
            *current = percent;
            changed
        });
        if progressed {
            self.emit(CacheEvent::BufferingProgress {
                resource_id: self.resource_id.clone(),
                percent,
            });
        }

        if self.store.is_complete() && !self.fully_cached.swap(true, Ordering::AcqRel) {
            self.on_fully_cached();
        }
    }

    fn on_fully_cached(&self) {
        let descriptor = self.store.descriptor();
        info!(
            resource_id = %self.resource_id,
            total_bytes = descriptor.total_size(),
            "Resource fully cached"
        );

        if let Some(tail_cache) = &self.tail_cache {
            let chunks: BTreeMap<usize, Bytes> =
                self.store.tail_chunks(self.tail_track_chunks).into_iter().collect();
            tail_cache.put(
                &self.resource_id,
                descriptor.url(),
                descriptor.total_size(),
                descriptor.chunk_size(),
                chunks,
            );
        }

        self.emit(CacheEvent::FullyCached {
            resource_id: self.resource_id.clone(),
            total_bytes: descriptor.total_size(),
        });
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(bus) = &self.event_bus {
            let _ = bus.emit(CoreEvent::Cache(event));
        }
    }
}

impl ChunkSink for ChunkIntake {
    fn accept(&self, index: usize, data: Bytes) -> bool {
        // Results landing after teardown are dropped.
        if self.cancel.is_cancelled() {
            return false;
        }

        match self.store.insert(index, data) {
            InsertOutcome::Inserted => {
                self.refresh();
                true
            }
            InsertOutcome::AlreadyPresent => true,
            InsertOutcome::Rejected { expected, actual } => {
                warn!(
                    resource_id = %self.resource_id,
                    chunk = index,
                    expected,
                    actual,
                    "Rejected chunk with wrong length"
                );
                false
            }
        }
    }
}

// ============================================================================
// Whole-Resource Download
// ============================================================================

/// Clears the "download running" flag when the job ends, however it ends.
struct ActiveFlag(Arc<AtomicBool>);

impl Drop for ActiveFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Background download of every chunk for the whole-resource strategies.
struct WholeResourceJob {
    resource_id: String,
    strategy: DownloadStrategy,
    fetcher: RangeFetcher,
    intake: Arc<ChunkIntake>,
    parallel_connections: usize,
    parallel_stagger: Duration,
    retry: RetryPolicy,
    preload: Arc<AtomicBool>,
    preload_chunk_limit: usize,
    active: Arc<AtomicBool>,
    event_bus: Option<Arc<EventBus>>,
    cancel: CancellationToken,
}

impl WholeResourceJob {
    #[instrument(skip(self), fields(resource_id = %self.resource_id, strategy = %self.strategy))]
    async fn run(self) {
        let _active = ActiveFlag(Arc::clone(&self.active));

        if self.strategy == DownloadStrategy::ParallelFull {
            let intake = Arc::clone(&self.intake);
            let progress = Arc::clone(&self.intake);
            let outcome = self
                .fetcher
                .fetch_all_parallel(
                    self.parallel_connections,
                    self.parallel_stagger,
                    move |index, data| {
                        intake.accept(index, data);
                    },
                    move |fraction| progress.set_download_progress(fraction),
                    &self.cancel,
                )
                .await;

            match outcome {
                Ok(true) => {
                    info!("Parallel download complete");
                    return;
                }
                Err(e) if e.is_cancelled() => return,
                Ok(false) => warn!("Parallel download had failures, falling back to sequential"),
                Err(e) => warn!(error = %e, "Parallel download failed, falling back to sequential"),
            }

            if let Some(bus) = &self.event_bus {
                let _ = bus.emit(CoreEvent::Cache(CacheEvent::StrategyFallback {
                    resource_id: self.resource_id.clone(),
                    from: DownloadStrategy::ParallelFull.as_str().to_string(),
                    to: DownloadStrategy::SequentialFull.as_str().to_string(),
                }));
            }
        }

        self.run_sequential().await;
    }

    async fn run_sequential(&self) {
        let store = Arc::clone(&self.intake.store);

        for attempt in 0..self.retry.max_attempts.max(1) {
            if store.is_complete() {
                return;
            }

            let result = self
                .fetcher
                .fetch_all_sequential(
                    |index, data| {
                        self.intake.accept(index, data);
                        let paused = self.preload.load(Ordering::Acquire)
                            && store.contains_all(0, self.preload_chunk_limit);
                        if paused {
                            ControlFlow::Break(())
                        } else {
                            ControlFlow::Continue(())
                        }
                    },
                    |fraction| self.intake.set_download_progress(fraction),
                    &self.cancel,
                )
                .await;

            match result {
                Err(e) if e.is_cancelled() => return,
                _ if store.is_complete() => {
                    info!("Sequential download complete");
                    return;
                }
                Ok(_) if self.preload.load(Ordering::Acquire) => {
                    debug!(chunks = store.len(), "Sequential download paused for preload");
                    return;
                }
                Ok(_) => warn!(attempt, cached = store.len(), "Sequential download ended early"),
                Err(e) => warn!(attempt, cached = store.len(), error = %e, "Sequential download failed"),
            }

            let delay = self.retry.delay_for_attempt(attempt, None);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        error!(
            cached = store.len(),
            total = store.descriptor().total_chunks(),
            "Sequential download gave up"
        );
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`StreamCacheManager`].
pub struct StreamCacheBuilder {
    resource_id: String,
    url: String,
    total_size: u64,
    http: Arc<dyn HttpClient>,
    config: StreamCacheConfig,
    headers: HashMap<String, String>,
    tail_cache: Option<Arc<TailCache>>,
    strategy_cache: Option<Arc<StrategyCache>>,
    event_bus: Option<Arc<EventBus>>,
    parent: Option<CancellationToken>,
}

impl StreamCacheBuilder {
    pub fn config(mut self, config: StreamCacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Headers sent with every request (User-Agent, auth, ...).
    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn tail_cache(mut self, tail_cache: Arc<TailCache>) -> Self {
        self.tail_cache = Some(tail_cache);
        self
    }

    pub fn strategy_cache(mut self, strategy_cache: Arc<StrategyCache>) -> Self {
        self.strategy_cache = Some(strategy_cache);
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Cancelling `parent` cancels this cache and all of its tasks.
    pub fn parent_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Validate the configuration and build the manager.
    ///
    /// Must be called inside a tokio runtime; its handle is captured for
    /// work spawned from synchronous entry points.
    pub fn build(self) -> Result<Arc<StreamCacheManager>> {
        self.config.validate().map_err(PlaybackError::InvalidConfig)?;
        let runtime =
            Handle::try_current().map_err(|e| PlaybackError::RuntimeUnavailable(e.to_string()))?;

        let descriptor = Arc::new(ResourceDescriptor::new(
            self.url,
            self.total_size,
            self.config.chunk_size,
        )?);
        let cancel = self
            .parent
            .map(|parent| parent.child_token())
            .unwrap_or_default();

        let store = Arc::new(ChunkStore::new(Arc::clone(&descriptor)));
        let fetcher = RangeFetcher::new(
            Arc::clone(&self.http),
            Arc::clone(&descriptor),
            self.headers.clone(),
            self.config.retry.to_policy(),
            self.config.chunk_body_timeout,
        );
        let bandwidth = Arc::new(BandwidthAllocator::new());

        let intake = Arc::new(ChunkIntake {
            resource_id: self.resource_id.clone(),
            store: Arc::clone(&store),
            rule: Mutex::new(ReadyRule {
                preload: false,
                require_tail: true,
                min_ready_chunks: self.config.min_ready_chunks,
            }),
            ready: watch::channel(false).0,
            progress: watch::channel(0).0,
            download_progress: Mutex::new(0.0),
            fully_cached: AtomicBool::new(false),
            tail_cache: self.tail_cache.clone(),
            tail_track_chunks: self.config.tail_track_chunks,
            event_bus: self.event_bus.clone(),
            cancel: cancel.clone(),
        });

        let coordinator = Arc::new(PlaybackCoordinator::new(
            Arc::clone(&store),
            fetcher.clone(),
            Arc::clone(&intake) as Arc<dyn ChunkSink>,
            Arc::clone(&bandwidth),
            &self.config,
            cancel.child_token(),
        ));

        let prefetcher = Arc::new(
            PredictivePrefetcher::new(
                self.resource_id.clone(),
                self.config.prefetch.clone(),
                fetcher.clone(),
                Arc::clone(&bandwidth),
                cancel.child_token(),
            )
            .with_event_bus(self.event_bus.clone()),
        );

        let state = BufferingStateMachine::new(self.resource_id.clone(), self.event_bus.clone());

        for (name, value) in &self.headers {
            debug!(header = %name, value = %redact_if_sensitive(name, value), "Request header");
        }
        debug!(
            resource_id = %self.resource_id,
            total_size = descriptor.total_size(),
            total_chunks = descriptor.total_chunks(),
            "Stream cache created"
        );

        Ok(Arc::new(StreamCacheManager {
            resource_id: self.resource_id,
            config: self.config,
            descriptor,
            http: self.http,
            headers: self.headers,
            store,
            fetcher,
            intake,
            coordinator,
            prefetcher,
            bandwidth,
            state,
            strategy: OnceLock::new(),
            tail_cache: self.tail_cache,
            strategy_cache: self.strategy_cache,
            event_bus: self.event_bus,
            runtime,
            preload: Arc::new(AtomicBool::new(false)),
            download_active: Arc::new(AtomicBool::new(false)),
            prefetch_started: AtomicBool::new(false),
            cancel,
        }))
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Holds the seek slot for the lifetime of one `seek` call.
struct SeekSlot<'a>(&'a BandwidthAllocator);

impl<'a> SeekSlot<'a> {
    fn activate(bandwidth: &'a BandwidthAllocator) -> Self {
        bandwidth.activate_seek();
        Self(bandwidth)
    }
}

impl Drop for SeekSlot<'_> {
    fn drop(&mut self) {
        self.0.deactivate_seek();
    }
}

/// Adaptive chunk cache over one remote resource.
pub struct StreamCacheManager {
    resource_id: String,
    config: StreamCacheConfig,
    descriptor: Arc<ResourceDescriptor>,
    http: Arc<dyn HttpClient>,
    headers: HashMap<String, String>,
    store: Arc<ChunkStore>,
    fetcher: RangeFetcher,
    intake: Arc<ChunkIntake>,
    coordinator: Arc<PlaybackCoordinator>,
    prefetcher: Arc<PredictivePrefetcher>,
    bandwidth: Arc<BandwidthAllocator>,
    state: BufferingStateMachine,
    strategy: OnceLock<DownloadStrategy>,
    tail_cache: Option<Arc<TailCache>>,
    strategy_cache: Option<Arc<StrategyCache>>,
    event_bus: Option<Arc<EventBus>>,
    runtime: Handle,
    preload: Arc<AtomicBool>,
    download_active: Arc<AtomicBool>,
    prefetch_started: AtomicBool,
    cancel: CancellationToken,
}

impl StreamCacheManager {
    /// Start building a cache for `url`, known to be `total_size` bytes.
    pub fn builder(
        resource_id: impl Into<String>,
        url: impl Into<String>,
        total_size: u64,
        http: Arc<dyn HttpClient>,
    ) -> StreamCacheBuilder {
        StreamCacheBuilder {
            resource_id: resource_id.into(),
            url: url.into(),
            total_size,
            http,
            config: StreamCacheConfig::default(),
            headers: HashMap::new(),
            tail_cache: None,
            strategy_cache: None,
            event_bus: None,
            parent: None,
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    pub fn config(&self) -> &StreamCacheConfig {
        &self.config
    }

    /// Strategy in use; `None` before [`initialize`](Self::initialize).
    pub fn strategy(&self) -> Option<DownloadStrategy> {
        self.strategy.get().copied()
    }

    pub fn buffering_state(&self) -> BufferingState {
        self.state.state()
    }

    pub fn is_fully_cached(&self) -> bool {
        self.store.is_complete()
    }

    pub fn bandwidth(&self) -> &BandwidthAllocator {
        &self.bandwidth
    }

    pub fn prefetcher(&self) -> &PredictivePrefetcher {
        &self.prefetcher
    }

    /// Buffering state changes; only actual changes wake receivers.
    pub fn subscribe_state(&self) -> watch::Receiver<BufferingState> {
        self.state.subscribe()
    }

    /// Share of the resource held in memory, in percent.
    pub fn subscribe_progress(&self) -> watch::Receiver<u8> {
        self.intake.progress.subscribe()
    }

    // ------------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------------

    async fn determine_strategy(&self) -> DownloadStrategy {
        if let Some(strategy) = self.strategy.get() {
            return *strategy;
        }

        let url = self.descriptor.url();
        let remembered = self.strategy_cache.as_ref().and_then(|cache| cache.get(url));
        let strategy = if let Some(forced) = self.config.forced_strategy {
            forced
        } else if let Some(strategy) = remembered {
            debug!(strategy = %strategy, "Using remembered strategy for host");
            strategy
        } else if self.config.probe_range_support {
            let support = probe_range_support(self.http.as_ref(), url, &self.headers).await;
            if let Some(length) = support.content_length {
                if length != self.descriptor.total_size() {
                    warn!(
                        reported = length,
                        expected = self.descriptor.total_size(),
                        "Server reports a different resource size"
                    );
                }
            }
            let strategy = select_strategy(
                support.supports_range,
                self.descriptor.total_size(),
                self.config.parallel_max_size,
            );
            if let Some(cache) = &self.strategy_cache {
                cache.insert(url, strategy);
            }
            strategy
        } else {
            DownloadStrategy::RangeRequests
        };

        let strategy = *self.strategy.get_or_init(|| strategy);
        info!(resource_id = %self.resource_id, strategy = %strategy, "Download strategy determined");
        self.emit(CacheEvent::StrategyDetermined {
            resource_id: self.resource_id.clone(),
            strategy: strategy.as_str().to_string(),
        });
        strategy
    }

    /// Get the resource ready for playback.
    ///
    /// Resolves once chunk 0 and the minimum ready set are cached, or when
    /// `chunk0_timeout` elapses; in the latter case the result is whether
    /// the minimum contiguous set happens to be present. With `is_preload`
    /// only chunk 0 is required and no backfill starts until
    /// [`mark_playing`](Self::mark_playing). Returns `false` when cancelled.
    #[instrument(skip(self, cancel), fields(resource_id = %self.resource_id))]
    pub async fn initialize(&self, is_preload: bool, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() || self.cancel.is_cancelled() {
            return false;
        }

        let strategy = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = self.cancel.cancelled() => return false,
            strategy = self.determine_strategy() => strategy,
        };

        self.preload.store(is_preload, Ordering::Release);
        self.intake.set_rule(ReadyRule {
            preload: is_preload,
            require_tail: strategy != DownloadStrategy::SequentialFull,
            min_ready_chunks: self.config.min_ready_chunks,
        });
        self.bandwidth.activate_main();
        if self.state.state() == BufferingState::Idle {
            self.state.set(BufferingState::Buffering);
        }

        if strategy.is_range_capable() {
            self.start_tail_fetch();
            let coordinator = Arc::clone(&self.coordinator);
            let scope = self.cancel.clone();
            self.runtime.spawn(async move {
                if !coordinator.request_urgent_chunk(0, &scope).await {
                    debug!("Urgent fetch of chunk 0 did not store it");
                }
            });
        }

        if is_preload {
            if strategy.is_whole_resource() {
                self.start_whole_resource_download(strategy);
            }
        } else {
            self.ensure_active_download();
        }

        let mut ready_rx = self.intake.ready.subscribe();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = self.cancel.cancelled() => None,
            waited = tokio::time::timeout(self.config.chunk0_timeout, ready_rx.wait_for(|ready| *ready)) => {
                Some(matches!(waited, Ok(Ok(_))))
            }
        };

        let Some(signalled) = outcome else {
            debug!("Initialization cancelled");
            return false;
        };

        let ready = signalled || self.minimum_set_present(is_preload);
        self.state.on_health(ready);

        if ready {
            info!(strategy = %strategy, preload = is_preload, "Stream cache ready");
        } else {
            error!(
                timeout_ms = self.config.chunk0_timeout.as_millis() as u64,
                "First chunk not available in time"
            );
        }
        self.emit(CacheEvent::Initialized {
            resource_id: self.resource_id.clone(),
            ready,
        });
        ready
    }

    fn minimum_set_present(&self, is_preload: bool) -> bool {
        let required = if is_preload {
            1
        } else {
            self.config
                .min_ready_chunks
                .min(self.descriptor.total_chunks())
        };
        self.store.contains_all(0, required)
    }

    /// Merge a tail cache hit, or fetch the tail in the background.
    fn start_tail_fetch(&self) {
        let count = self.config.tail_chunk_count;
        if count == 0 {
            return;
        }

        if let Some(tail_cache) = &self.tail_cache {
            if let Some(entry) = tail_cache.get(
                &self.resource_id,
                self.descriptor.url(),
                self.descriptor.total_size(),
                self.descriptor.chunk_size(),
            ) {
                debug!(chunks = entry.chunks.len(), "Tail cache hit");
                for (index, data) in &entry.chunks {
                    self.intake.accept(*index, data.clone());
                }
                return;
            }

            let tail_cache = Arc::clone(tail_cache);
            let resource_id = self.resource_id.clone();
            let coordinator = Arc::clone(&self.coordinator);
            let intake = Arc::clone(&self.intake);
            let scope = self.cancel.clone();
            self.runtime.spawn(async move {
                if let Some(entry) = tail_cache.warm(&resource_id, &coordinator, count, &scope).await {
                    for (index, data) in &entry.chunks {
                        intake.accept(*index, data.clone());
                    }
                }
            });
            return;
        }

        let last = self.descriptor.last_chunk();
        let first = (last + 1).saturating_sub(count);
        let coordinator = Arc::clone(&self.coordinator);
        let scope = self.cancel.clone();
        self.runtime.spawn(async move {
            for index in first..=last {
                coordinator.request_urgent_chunk(index, &scope).await;
            }
        });
    }

    fn start_whole_resource_download(&self, strategy: DownloadStrategy) {
        if self.store.is_complete() || self.download_active.swap(true, Ordering::AcqRel) {
            return;
        }

        let job = WholeResourceJob {
            resource_id: self.resource_id.clone(),
            strategy,
            fetcher: self.fetcher.clone(),
            intake: Arc::clone(&self.intake),
            parallel_connections: self.config.parallel_connections,
            parallel_stagger: self.config.parallel_stagger,
            retry: self.config.retry.to_policy(),
            preload: Arc::clone(&self.preload),
            preload_chunk_limit: (self.config.min_ready_chunks + 1)
                .min(self.descriptor.total_chunks()),
            active: Arc::clone(&self.download_active),
            event_bus: self.event_bus.clone(),
            cancel: self.cancel.child_token(),
        };
        self.runtime.spawn(job.run());
    }

    fn start_prefetch(&self, strategy: DownloadStrategy) {
        let prefetch = &self.config.prefetch;
        if !prefetch.enabled
            || !strategy.is_range_capable()
            || self.descriptor.total_size() <= prefetch.min_resource_size
            || self.prefetch_started.swap(true, Ordering::AcqRel)
        {
            return;
        }

        let prefetcher = Arc::clone(&self.prefetcher);
        self.runtime.spawn(async move {
            prefetcher.run().await;
        });
    }

    /// Make sure background download is running for the chosen strategy.
    ///
    /// No-op before [`initialize`](Self::initialize) or once fully cached.
    pub fn ensure_active_download(&self) {
        let Some(strategy) = self.strategy() else {
            return;
        };
        if self.cancel.is_cancelled() || self.store.is_complete() {
            return;
        }

        match strategy {
            DownloadStrategy::RangeRequests => self.coordinator.start(&self.runtime),
            DownloadStrategy::ParallelFull | DownloadStrategy::SequentialFull => {
                self.start_whole_resource_download(strategy)
            }
        }
        self.start_prefetch(strategy);
    }

    /// Playback started: leave preload mode and download everything.
    pub fn mark_playing(&self) {
        self.preload.store(false, Ordering::Release);
        self.intake.set_rule(ReadyRule {
            preload: false,
            require_tail: self.strategy() != Some(DownloadStrategy::SequentialFull),
            min_ready_chunks: self.config.min_ready_chunks,
        });
        self.state.mark_playing();
        self.ensure_active_download();
    }

    // ------------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------------

    fn merge_prefetch(&self, position: u64) {
        if let Some(segment) = self.prefetcher.is_position_covered(position) {
            for (index, data) in segment.chunks() {
                self.intake.accept(index, data);
            }
        }
    }

    /// Copy cached bytes starting at `position` into `buf`.
    ///
    /// Never blocks; 0 means "not cached yet" (or end of resource). A miss
    /// on a range-capable strategy triggers an urgent fetch of that chunk.
    pub fn read(&self, position: u64, buf: &mut [u8]) -> usize {
        if buf.is_empty() || position >= self.descriptor.total_size() {
            return 0;
        }

        self.merge_prefetch(position);
        let copied = self.store.read_into(position, buf);
        if copied == 0 {
            self.on_read_miss(position);
        }
        copied
    }

    fn on_read_miss(&self, position: u64) {
        let strategy_allows = self
            .strategy()
            .map(|s| s.is_range_capable())
            .unwrap_or(false);
        let index = self.descriptor.chunk_for(position);
        if !strategy_allows
            || self.cancel.is_cancelled()
            || self.coordinator.scheduler().is_in_flight(index)
        {
            return;
        }

        debug!(chunk = index, "Read miss, requesting chunk");
        let coordinator = Arc::clone(&self.coordinator);
        let scope = self.cancel.clone();
        self.runtime.spawn(async move {
            coordinator.request_urgent_chunk(index, &scope).await;
        });
    }

    /// Like [`read`](Self::read), optionally waiting for data.
    ///
    /// With `wait`, polls at `health_poll_interval` for up to
    /// `read_wait_timeout`. Returns 0 on timeout or cancellation.
    pub async fn read_async(
        &self,
        position: u64,
        buf: &mut [u8],
        wait: bool,
        cancel: &CancellationToken,
    ) -> usize {
        let copied = self.read(position, buf);
        if copied > 0 || !wait || position >= self.descriptor.total_size() {
            return copied;
        }

        let deadline = Instant::now() + self.config.read_wait_timeout;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return 0,
                _ = self.cancel.cancelled() => return 0,
                _ = tokio::time::sleep(self.config.health_poll_interval) => {}
            }

            self.merge_prefetch(position);
            let copied = self.store.read_into(position, buf);
            if copied > 0 {
                return copied;
            }
            if Instant::now() >= deadline {
                debug!(position, "Timed out waiting for data");
                return 0;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Seeking
    // ------------------------------------------------------------------------

    /// Synchronous part of a seek: move the window and queue urgent work.
    ///
    /// Returns the target chunk.
    pub fn prepare_seek(&self, position: u64) -> usize {
        let position = position.min(self.descriptor.total_size());
        self.merge_prefetch(position);
        self.coordinator.on_seek(position);

        let target = self.descriptor.chunk_for(position);
        let range_capable = self
            .strategy()
            .map(|s| s.is_range_capable())
            .unwrap_or(false);

        if range_capable && self.descriptor.fraction(position) > self.config.seek_tail_threshold {
            let last = self.descriptor.last_chunk();
            let first = (target + 1).max((last + 1).saturating_sub(self.config.seek_tail_chunks));
            if first <= last {
                debug!(first, last, "Seek near end, requesting final chunks");
                let coordinator = Arc::clone(&self.coordinator);
                let scope = self.cancel.clone();
                self.runtime.spawn(async move {
                    for index in first..=last {
                        coordinator.request_urgent_chunk(index, &scope).await;
                    }
                });
            }
        }

        self.ensure_active_download();
        target
    }

    /// Jump playback to `position`.
    ///
    /// On range-capable strategies waits for the target chunk through the
    /// urgent path. Returns `false` only when cancelled.
    #[instrument(skip(self, cancel), fields(resource_id = %self.resource_id))]
    pub async fn seek(&self, position: u64, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() || self.cancel.is_cancelled() {
            return false;
        }

        let seek_slot = SeekSlot::activate(&self.bandwidth);
        let target = self.prepare_seek(position);

        let range_capable = self
            .strategy()
            .map(|s| s.is_range_capable())
            .unwrap_or(false);
        if range_capable && position < self.descriptor.total_size() {
            let stored = self.coordinator.request_urgent_chunk(target, cancel).await;
            if !stored && !cancel.is_cancelled() {
                debug!(chunk = target, "Seek target not cached yet");
            }
        }

        drop(seek_slot);
        if cancel.is_cancelled() {
            return false;
        }

        self.check_health(position, true);
        true
    }

    // ------------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------------

    /// Count cached chunks needed to play from `position`.
    ///
    /// Playback-grade checks need `min_ready_chunks`, exploratory checks one;
    /// both are capped by the chunks left. Playback-grade checks also drive
    /// the buffering state machine.
    pub fn check_health(&self, position: u64, for_playback: bool) -> CacheHealthInfo {
        self.merge_prefetch(position);

        let target = self.descriptor.chunk_for(position);
        let base = if for_playback {
            self.config.min_ready_chunks
        } else {
            1
        };
        let required = base.min(self.descriptor.total_chunks() - target);
        let ready = self.store.count_in(target, target + required);
        let info = CacheHealthInfo::new(target, ready, required);

        if for_playback {
            self.state.on_health(info.is_ready);
        }
        info
    }

    /// Ordinary playback progression.
    pub fn update_playback_position(&self, position: u64) {
        self.coordinator.update_position(position);
    }

    /// Poll until the chunk at `position` is cached, `timeout` passes or `cancel` fires.
    pub async fn wait_for_position_ready(
        &self,
        position: u64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        self.poll_health(position, false, timeout, cancel).await
    }

    /// Poll until [`check_health`](Self::check_health) reports ready, bounded by `read_wait_timeout`.
    pub async fn wait_for_cache_ready(
        &self,
        position: u64,
        for_playback: bool,
        cancel: &CancellationToken,
    ) -> bool {
        self.poll_health(position, for_playback, self.config.read_wait_timeout, cancel)
            .await
    }

    async fn poll_health(
        &self,
        position: u64,
        for_playback: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.check_health(position, for_playback).is_ready {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.health_poll_interval) => {}
            }
        }
    }

    // ------------------------------------------------------------------------
    // Host helpers
    // ------------------------------------------------------------------------

    /// Seed the store with leading bytes obtained elsewhere.
    ///
    /// Split into chunks from offset 0; a trailing partial chunk is ignored.
    /// Returns the number of chunks accepted.
    pub fn inject_initial_data(&self, data: Bytes) -> usize {
        let mut accepted = 0;
        for index in 0..self.descriptor.total_chunks() {
            let Some(len) = self.descriptor.expected_len(index) else {
                break;
            };
            let start = self.descriptor.chunk_start(index) as usize;
            if start + len > data.len() {
                break;
            }
            if self.intake.accept(index, data.slice(start..start + len)) {
                accepted += 1;
            }
        }
        debug!(accepted, bytes = data.len(), "Injected initial data");
        accepted
    }

    /// Whether this cache can give up bandwidth to preload another resource.
    pub fn can_spare_bandwidth_for_preload(&self) -> bool {
        if self.store.is_complete() {
            return true;
        }
        let fill = self.store.cached_bytes() as f64 / self.descriptor.total_size() as f64;
        match self.strategy() {
            Some(DownloadStrategy::RangeRequests) => {
                self.state.state() == BufferingState::Playing && fill >= 0.20
            }
            _ => fill >= 0.65,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let scheduler = self.coordinator.scheduler();
        CacheStats {
            strategy: self.strategy(),
            state: self.state.state(),
            cached_chunks: self.store.len(),
            total_chunks: self.descriptor.total_chunks(),
            cached_bytes: self.store.cached_bytes(),
            total_bytes: self.descriptor.total_size(),
            fully_cached: self.store.is_complete(),
            pending_requests: scheduler.pending_len(),
            in_flight_requests: scheduler.in_flight_len(),
            prefetch_segments: self.prefetcher.stats().segments,
            download_progress: *self.intake.download_progress.lock(),
        }
    }

    /// Whether the startup ready condition currently holds.
    pub fn is_ready(&self) -> bool {
        self.intake.is_ready()
    }

    /// Cancel every task and release cached data.
    pub fn shutdown(&self) {
        info!(resource_id = %self.resource_id, "Shutting down stream cache");
        self.cancel.cancel();
        self.prefetcher.stop_all();
        self.prefetcher.clear();
        self.bandwidth.deactivate_main();
        self.store.clear();
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(bus) = &self.event_bus {
            let _ = bus.emit(CoreEvent::Cache(event));
        }
    }
}

impl Drop for StreamCacheManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for StreamCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCacheManager")
            .field("resource_id", &self.resource_id)
            .field("strategy", &self.strategy())
            .field("state", &self.state.state())
            .field("store", &self.store)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::bandwidth::ConnectionClass;
    use crate::cache::test_support::RangeServer;
    use crate::config::PrefetchConfig;

    fn manager(server: Arc<RangeServer>, config: StreamCacheConfig) -> Arc<StreamCacheManager> {
        StreamCacheManager::builder("track-1", server.url(), server.len() as u64, server)
            .config(config)
            .build()
            .unwrap()
    }

    fn config() -> StreamCacheConfig {
        StreamCacheConfig::default()
            .with_chunk_size(1000)
            .with_health_poll_interval(Duration::from_millis(5))
            .with_prefetch(PrefetchConfig::disabled())
    }

    #[test]
    fn test_build_requires_runtime() {
        let server = Arc::new(RangeServer::new(10_000));
        let err = StreamCacheManager::builder("t", server.url(), 10_000, server)
            .build()
            .unwrap_err();
        assert!(matches!(err, PlaybackError::RuntimeUnavailable(_)));
    }

    #[tokio::test]
    async fn test_build_rejects_bad_input() {
        let server = Arc::new(RangeServer::new(10_000));
        let err = StreamCacheManager::builder("t", server.url(), 0, server.clone())
            .build()
            .unwrap_err();
        assert!(matches!(err, PlaybackError::InvalidResource(_)));

        let err = StreamCacheManager::builder("t", server.url(), 10, server)
            .config(StreamCacheConfig::default().with_chunk_size(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, PlaybackError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_health_counts_required_window() {
        let server = Arc::new(RangeServer::new(10_000));
        let cache = manager(server, config());
        for index in [3, 4, 5] {
            cache.intake.accept(index, Bytes::from(vec![0u8; 1000]));
        }

        let info = cache.check_health(3000, true);
        assert_eq!(info.target_chunk, 3);
        assert_eq!(info.required_chunks, 3);
        assert_eq!(info.ready_chunks, 3);
        assert!(info.is_ready);

        let info = cache.check_health(9500, true);
        assert_eq!(info.target_chunk, 9);
        assert_eq!(info.required_chunks, 1);
        assert!(!info.is_ready);
    }

    #[tokio::test]
    async fn test_inject_initial_data() {
        let server = Arc::new(RangeServer::new(10_000));
        let cache = manager(server, config());

        assert_eq!(cache.inject_initial_data(Bytes::from(vec![1u8; 2500])), 2);
        assert!(cache.store.contains_all(0, 2));
        assert!(!cache.store.contains(2));
        assert_eq!(*cache.subscribe_progress().borrow(), 20);
    }

    #[tokio::test]
    async fn test_preload_only_needs_first_chunk() {
        let server = Arc::new(RangeServer::new(100_000));
        let cache = manager(Arc::clone(&server), config());

        assert!(cache.initialize(true, &CancellationToken::new()).await);
        assert_eq!(cache.strategy(), Some(DownloadStrategy::RangeRequests));
        assert!(cache.store.contains(0));
        assert!(!cache.coordinator.is_running());

        cache.mark_playing();
        assert_eq!(cache.buffering_state(), BufferingState::Playing);
        assert!(cache.coordinator.is_running());
        cache.shutdown();
    }

    #[tokio::test]
    async fn test_cancelled_operations_report_false() {
        let server = Arc::new(RangeServer::new(10_000));
        let cache = manager(server, config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(!cache.initialize(false, &cancel).await);
        assert!(!cache.seek(5000, &cancel).await);
        let mut buf = [0u8; 10];
        assert_eq!(cache.read_async(5000, &mut buf, true, &cancel).await, 0);
        assert!(!cache.wait_for_cache_ready(5000, true, &cancel).await);
    }

    #[tokio::test]
    async fn test_abandoned_seek_releases_seek_slot() {
        let server = Arc::new(RangeServer::new(10_000));
        let cache = manager(server, config());
        assert_eq!(cache.determine_strategy().await, DownloadStrategy::RangeRequests);

        // Another fetch holds chunk 6, so the seek keeps waiting for it.
        assert!(cache.coordinator.scheduler().try_claim(6));
        let cancel = CancellationToken::new();
        let seek = tokio::time::timeout(Duration::from_millis(30), cache.seek(6500, &cancel)).await;
        assert!(seek.is_err());
        assert!(!cache.bandwidth().is_active(ConnectionClass::FastSeek));

        cache.coordinator.scheduler().mark_completed(6);
        assert!(cache.seek(6500, &cancel).await);
        assert!(!cache.bandwidth().is_active(ConnectionClass::FastSeek));
    }

    #[tokio::test]
    async fn test_spare_bandwidth() {
        let server = Arc::new(RangeServer::new(4_000));
        let cache = manager(server, config().with_forced_strategy(DownloadStrategy::SequentialFull));
        assert!(!cache.can_spare_bandwidth_for_preload());

        cache.inject_initial_data(Bytes::from(vec![0u8; 3000]));
        assert!(cache.can_spare_bandwidth_for_preload());
    }

    #[tokio::test]
    async fn test_shutdown_discards_late_chunks() {
        let server = Arc::new(RangeServer::new(10_000));
        let cache = manager(server, config());
        cache.shutdown();

        assert!(!cache.intake.accept(0, Bytes::from(vec![0u8; 1000])));
        assert_eq!(cache.stats().cached_chunks, 0);
    }
}

//! End-to-end tests for the stream cache against an in-memory origin.

mod common;

use bytes::Bytes;
use common::{byte_at, eventually, MockTransport};
use core_playback::cache::{BufferingState, DownloadStrategy, StreamCacheManager, TailCache};
use core_playback::config::{PrefetchConfig, RetryConfig, StreamCacheConfig};
use core_runtime::events::{CacheEvent, CoreEvent, EventBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;
use tokio_util::sync::CancellationToken;

const TOTAL: usize = 2_560_000;
const CHUNK: usize = 256_000;

fn config() -> StreamCacheConfig {
    StreamCacheConfig::default()
        .with_chunk_size(CHUNK)
        .with_health_poll_interval(Duration::from_millis(10))
        .with_retry(RetryConfig::immediate(2))
}

fn drain(rx: &mut Receiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_range_startup_reads_head_and_tail() {
    let transport = Arc::new(MockTransport::new(TOTAL));
    let bus = Arc::new(EventBus::new(1024));
    let mut events = bus.subscribe();

    let cache = StreamCacheManager::builder("track-01", transport.url(), TOTAL as u64, transport.clone())
        .config(config())
        .event_bus(Arc::clone(&bus))
        .build()
        .unwrap();

    assert_eq!(cache.descriptor().total_chunks(), 10);
    assert_eq!(cache.descriptor().expected_len(9), Some(CHUNK));

    let cancel = CancellationToken::new();
    assert!(cache.initialize(false, &cancel).await);
    assert_eq!(cache.strategy(), Some(DownloadStrategy::RangeRequests));
    assert_eq!(cache.buffering_state(), BufferingState::Ready);
    assert!(cache.is_ready());

    assert!(cache.check_health(0, true).is_ready);

    // Head and tail are both readable right away.
    let mut head = vec![0u8; CHUNK];
    assert_eq!(cache.read(0, &mut head), CHUNK);
    assert!(head.iter().enumerate().all(|(i, b)| *b == byte_at(i as u64)));

    let mut tail = vec![0u8; 4096];
    let last_offset = TOTAL as u64 - 100;
    assert_eq!(cache.read(last_offset, &mut tail), 100);
    assert_eq!(tail[99], byte_at(TOTAL as u64 - 1));

    // The ready head spans several chunks, so reads cross chunk boundaries.
    let mut span = vec![0u8; 1000];
    let boundary = CHUNK as u64 - 10;
    assert_eq!(cache.read(boundary, &mut span), 1000);
    assert!(span
        .iter()
        .enumerate()
        .all(|(i, b)| *b == byte_at(boundary + i as u64)));

    assert_eq!(cache.read(TOTAL as u64, &mut span), 0);

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::Cache(CacheEvent::StrategyDetermined { strategy, .. }) if strategy == "range_requests"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::Cache(CacheEvent::Initialized { ready: true, .. })
    )));

    cache.shutdown();
}

#[tokio::test]
async fn test_playback_progress_fills_whole_resource() {
    let transport = Arc::new(MockTransport::new(TOTAL));
    let cache = StreamCacheManager::builder("track-01", transport.url(), TOTAL as u64, transport.clone())
        .config(config())
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    assert!(cache.initialize(false, &cancel).await);
    cache.mark_playing();

    let mut position = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    while position < TOTAL as u64 {
        let n = cache.read_async(position, &mut buf, true, &cancel).await;
        assert!(n > 0, "stalled at {}", position);
        assert_eq!(buf[0], byte_at(position));
        position += n as u64;
        cache.update_playback_position(position);
    }

    assert!(eventually(|| cache.is_fully_cached()).await);
    let stats = cache.stats();
    assert_eq!(stats.cached_chunks, 10);
    assert_eq!(stats.cached_bytes, TOTAL as u64);
    assert_eq!(*cache.subscribe_progress().borrow(), 100);
    assert!(cache.can_spare_bandwidth_for_preload());
}

#[tokio::test]
async fn test_seek_near_end_becomes_ready() {
    let transport = Arc::new(MockTransport::new(TOTAL));
    let cache = StreamCacheManager::builder("track-01", transport.url(), TOTAL as u64, transport.clone())
        .config(config())
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    assert!(cache.initialize(false, &cancel).await);

    let target = (TOTAL as f64 * 0.95) as u64;
    assert!(cache.seek(target, &cancel).await);

    let health = cache.check_health(target, false);
    assert_eq!(health.target_chunk, 9);
    assert_eq!(health.required_chunks, 1);
    assert!(health.is_ready);

    let mut buf = [0u8; 16];
    assert_eq!(cache.read(target, &mut buf), 16);
    assert_eq!(buf[0], byte_at(target));
}

#[tokio::test]
async fn test_seek_to_middle_waits_for_target() {
    let transport = Arc::new(MockTransport::new(TOTAL).with_latency(Duration::from_millis(20)));
    let cache = StreamCacheManager::builder("track-01", transport.url(), TOTAL as u64, transport.clone())
        .config(config())
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    assert!(cache.initialize(false, &cancel).await);

    let target = 7 * CHUNK as u64 + 5;
    assert!(cache.seek(target, &cancel).await);
    assert!(cache.check_health(target, false).is_ready);
    assert!(cache
        .wait_for_cache_ready(target, true, &cancel)
        .await);
}

#[tokio::test]
async fn test_parallel_failure_falls_back_to_sequential() {
    let transport = Arc::new(
        MockTransport::new(TOTAL)
            .without_ranges()
            .failing_ranged_gets(),
    );
    let bus = Arc::new(EventBus::new(1024));
    let mut events = bus.subscribe();

    let cache = StreamCacheManager::builder("track-02", transport.url(), TOTAL as u64, transport.clone())
        .config(
            config()
                .with_retry(RetryConfig::immediate(1))
                .with_parallel(4, Duration::ZERO),
        )
        .event_bus(Arc::clone(&bus))
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    assert!(cache.initialize(false, &cancel).await);
    assert_eq!(cache.strategy(), Some(DownloadStrategy::ParallelFull));
    assert!(eventually(|| cache.is_fully_cached()).await);

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::Cache(CacheEvent::StrategyFallback { from, to, .. })
            if from == "parallel_full" && to == "sequential_full"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::Cache(CacheEvent::FullyCached { total_bytes, .. }) if *total_bytes == TOTAL as u64
    )));
}

#[tokio::test]
async fn test_sequential_preload_pauses_until_playing() {
    let transport = Arc::new(MockTransport::new(TOTAL).without_ranges());
    let mut config = config();
    config.parallel_max_size = 0;

    let cache = StreamCacheManager::builder("track-03", transport.url(), TOTAL as u64, transport.clone())
        .config(config)
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    assert!(cache.initialize(true, &cancel).await);
    assert_eq!(cache.strategy(), Some(DownloadStrategy::SequentialFull));

    // Preload stops after the ready set plus one chunk.
    assert!(eventually(|| cache.stats().cached_chunks == 4).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cache.stats().cached_chunks, 4);

    cache.mark_playing();
    assert_eq!(cache.buffering_state(), BufferingState::Playing);
    assert!(eventually(|| cache.is_fully_cached()).await);
}

#[tokio::test]
async fn test_tail_cache_shared_and_evicted_by_memory() {
    const SMALL: usize = 40_000;
    let tail_cache = Arc::new(TailCache::new(60_000));
    let small_config = config()
        .with_chunk_size(10_000)
        .with_prefetch(PrefetchConfig::disabled());

    for id in ["first", "second"] {
        let transport = Arc::new(MockTransport::new(SMALL));
        let cache = StreamCacheManager::builder(id, transport.url(), SMALL as u64, transport.clone())
            .config(small_config.clone())
            .tail_cache(Arc::clone(&tail_cache))
            .build()
            .unwrap();
        assert!(cache.initialize(false, &CancellationToken::new()).await);
        assert!(eventually(|| cache.is_fully_cached()).await);
        assert!(eventually(|| tail_cache.contains(id)).await);
        cache.shutdown();
    }

    // Each entry holds four 10 kB chunks; only one fits under the ceiling.
    assert!(!tail_cache.contains("first"));
    assert!(tail_cache.contains("second"));
    assert_eq!(tail_cache.memory_usage(), 40_000);

    // A later session for the same resource starts with its tail in place.
    let transport = Arc::new(MockTransport::new(SMALL).with_latency(Duration::from_millis(50)));
    let cache = StreamCacheManager::builder("second", transport.url(), SMALL as u64, transport.clone())
        .config(small_config)
        .tail_cache(Arc::clone(&tail_cache))
        .build()
        .unwrap();
    assert!(cache.initialize(false, &CancellationToken::new()).await);
    let mut buf = [0u8; 8];
    assert_eq!(cache.read(SMALL as u64 - 8, &mut buf), 8);
}

#[tokio::test]
async fn test_tail_from_other_chunk_size_is_not_reused() {
    const LEN: usize = 2500;
    let tail_cache = Arc::new(TailCache::new(1_000_000));
    let session = |chunk: usize, transport: Arc<MockTransport>| {
        StreamCacheManager::builder("track-07", transport.url(), LEN as u64, transport)
            .config(
                config()
                    .with_chunk_size(chunk)
                    .with_prefetch(PrefetchConfig::disabled()),
            )
            .tail_cache(Arc::clone(&tail_cache))
            .build()
            .unwrap()
    };

    let first = session(1000, Arc::new(MockTransport::new(LEN)));
    assert!(first.initialize(false, &CancellationToken::new()).await);
    assert!(eventually(|| tail_cache.contains("track-07")).await);
    first.shutdown();

    // Chunk 2 is 2000..2500 above but 1000..1500 here, with the same length.
    let second = session(500, Arc::new(MockTransport::new(LEN)));
    let cancel = CancellationToken::new();
    assert!(second.initialize(false, &cancel).await);

    let mut buf = vec![0u8; 500];
    assert_eq!(second.read_async(1000, &mut buf, true, &cancel).await, 500);
    assert!(buf
        .iter()
        .enumerate()
        .all(|(i, b)| *b == byte_at(1000 + i as u64)));

    let url = second.descriptor().url().to_string();
    assert!(eventually(|| tail_cache.get("track-07", &url, LEN as u64, 500).is_some()).await);
    second.shutdown();
}

#[tokio::test]
async fn test_health_reports_missing_chunks() {
    let transport = Arc::new(MockTransport::new(TOTAL));
    let cache = StreamCacheManager::builder("track-04", transport.url(), TOTAL as u64, transport.clone())
        .config(config())
        .build()
        .unwrap();

    let position = 3 * CHUNK as u64 + 100;
    let health = cache.check_health(position, true);
    assert_eq!(health.target_chunk, 3);
    assert_eq!(health.required_chunks, 3);
    assert_eq!(health.ready_chunks, 0);
    assert_eq!(health.missing_chunks, 3);
    assert!(!health.is_ready);
    assert!(health.is_buffering);

    let data: Vec<u8> = (0..(6 * CHUNK) as u64).map(byte_at).collect();
    assert_eq!(cache.inject_initial_data(Bytes::from(data)), 6);

    let health = cache.check_health(position, true);
    assert_eq!(health.ready_chunks, 3);
    assert!(health.is_ready);
    assert_eq!(health.progress, 1.0);

    // Near the end only the chunks that exist are required.
    let health = cache.check_health(TOTAL as u64 - 1, true);
    assert_eq!(health.required_chunks, 1);
    assert!(!health.is_ready);
}

#[tokio::test]
async fn test_unreachable_origin_times_out_initialization() {
    let transport = Arc::new(MockTransport::new(TOTAL));
    transport.set_offline(true);

    let cache = StreamCacheManager::builder("track-05", transport.url(), TOTAL as u64, transport.clone())
        .config(
            config()
                .with_forced_strategy(DownloadStrategy::RangeRequests)
                .with_chunk0_timeout(Duration::from_millis(200)),
        )
        .build()
        .unwrap();

    assert!(!cache.initialize(false, &CancellationToken::new()).await);
    assert_eq!(cache.buffering_state(), BufferingState::Buffering);

    // The origin comes back: a seek recovers the session.
    transport.set_offline(false);
    assert!(cache.seek(0, &CancellationToken::new()).await);
    assert!(cache
        .wait_for_position_ready(0, Duration::from_secs(5), &CancellationToken::new())
        .await);
}

#[tokio::test]
async fn test_cancellation_stops_everything() {
    let transport = Arc::new(MockTransport::new(TOTAL).with_latency(Duration::from_millis(300)));
    let parent = CancellationToken::new();
    let cache = StreamCacheManager::builder("track-06", transport.url(), TOTAL as u64, transport.clone())
        .config(config().with_forced_strategy(DownloadStrategy::RangeRequests))
        .parent_cancellation(&parent)
        .build()
        .unwrap();

    let caller = CancellationToken::new();
    let trigger = caller.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    assert!(!cache.initialize(false, &caller).await);

    parent.cancel();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(cache.stats().cached_chunks, 0);

    let mut buf = [0u8; 16];
    assert_eq!(cache.read_async(0, &mut buf, true, &CancellationToken::new()).await, 0);
}

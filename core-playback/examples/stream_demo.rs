//! # Stream Cache Demo
//!
//! Opens a remote file through the stream cache, reads the head, seeks near
//! the end and prints cache statistics.
//!
//! Run with: `cargo run --example stream_demo --package core-playback -- <url>`

use bridge_desktop::ReqwestHttpClient;
use bridge_traits::{HttpClient, HttpRequest};
use core_playback::{StreamCacheConfig, StreamCacheManager, TailCache};
use core_runtime::logging::{init_logging, redact_url, LogFormat, LoggingConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LoggingConfig::default().with_format(LogFormat::Compact))?;

    let url = std::env::args()
        .nth(1)
        .ok_or("usage: stream_demo <url>")?;
    let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new()?);

    let head = http.execute(HttpRequest::head(&url)).await?;
    let total_size = head.content_length().ok_or("server did not report a length")?;
    info!(url = %redact_url(&url), total_size, "Opening stream");

    let tail_cache = Arc::new(TailCache::default());
    let cache = StreamCacheManager::builder("demo", &url, total_size, Arc::clone(&http))
        .config(StreamCacheConfig::low_latency())
        .tail_cache(tail_cache)
        .build()?;

    let cancel = CancellationToken::new();
    if !cache.initialize(false, &cancel).await {
        return Err("first chunk not available".into());
    }
    cache.mark_playing();

    let mut buf = vec![0u8; 16 * 1024];
    let n = cache.read_async(0, &mut buf, true, &cancel).await;
    info!(bytes = n, "Read head");

    let near_end = total_size * 95 / 100;
    cache.seek(near_end, &cancel).await;
    let health = cache.check_health(near_end, true);
    info!(
        ready = health.is_ready,
        ready_chunks = health.ready_chunks,
        required = health.required_chunks,
        "Health after seek"
    );

    let stats = cache.stats();
    info!(
        strategy = ?stats.strategy,
        state = %stats.state,
        cached = stats.cached_chunks,
        total = stats.total_chunks,
        usage_percent = stats.usage_percentage(),
        "Cache stats"
    );

    cache.shutdown();
    Ok(())
}

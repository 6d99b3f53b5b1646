//! # Stream Cache Module
//!
//! Turns a remote byte-addressable resource into a locally buffered,
//! randomly readable stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │     StreamCacheManager                     │
//! │  - initialize() / read() / seek()          │
//! │  - check_health() / buffering state        │
//! └────────┬───────────────────────────────────┘
//!          │
//!          ├──> PlaybackCoordinator ──> HotspotTracker
//!          │         │                  PriorityScheduler
//!          │         └──> worker pool ──> RangeFetcher ──> HttpClient
//!          ├──> ChunkStore (DashMap)
//!          ├──> PredictivePrefetcher (serial segments)
//!          ├──> BandwidthAllocator (policy signal)
//!          └──> TailCache (shared, LRU by memory)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_playback::cache::StreamCacheManager;
//! use tokio_util::sync::CancellationToken;
//!
//! let cache = StreamCacheManager::builder("track-42", url, total_size, http_client)
//!     .tail_cache(tail_cache.clone())
//!     .build()?;
//!
//! let cancel = CancellationToken::new();
//! if cache.initialize(false, &cancel).await {
//!     let mut buf = vec![0u8; 64 * 1024];
//!     let n = cache.read_async(0, &mut buf, true, &cancel).await;
//! }
//! ```

pub mod bandwidth;
pub mod chunk;
pub mod coordinator;
pub mod fetcher;
pub mod hotspot;
pub mod manager;
pub mod prefetch;
pub mod reader;
pub mod scheduler;
pub mod state;
pub mod stats;
pub mod store;
pub mod strategy;
pub mod tail;

// Re-export commonly used types
pub use bandwidth::{BandwidthAllocator, BandwidthSnapshot, ConnectionClass};
pub use chunk::ResourceDescriptor;
pub use coordinator::PlaybackCoordinator;
pub use fetcher::RangeFetcher;
pub use hotspot::{HotWindow, HotspotTracker};
pub use manager::{StreamCacheBuilder, StreamCacheManager};
pub use prefetch::{PredictivePrefetcher, PrefetchSegment, PrefetchStats};
pub use reader::CacheReader;
pub use scheduler::PriorityScheduler;
pub use state::{BufferingState, BufferingStateMachine, CacheHealthInfo};
pub use stats::CacheStats;
pub use store::{ChunkSink, ChunkStore, InsertOutcome};
pub use strategy::{probe_range_support, select_strategy, DownloadStrategy, RangeSupport, StrategyCache};
pub use tail::{TailCache, TailCacheStats, TailEntry};

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use bridge_traits::error::Result;
    use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, StreamingResponse};
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory server honouring byte ranges.
    pub struct RangeServer {
        data: Bytes,
        requests: AtomicUsize,
    }

    impl RangeServer {
        pub fn new(len: usize) -> Self {
            Self {
                data: Bytes::from((0..len).map(|i| (i % 253) as u8).collect::<Vec<u8>>()),
                requests: AtomicUsize::new(0),
            }
        }

        pub fn url(&self) -> &'static str {
            "https://media.example.com/track.flac"
        }

        pub fn len(&self) -> usize {
            self.data.len()
        }

        pub fn request_count(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }

        fn span(&self, request: &HttpRequest) -> Option<(usize, usize)> {
            let value = request.headers.get("Range")?.strip_prefix("bytes=")?;
            let (start, end) = value.split_once('-')?;
            let start: usize = start.parse().ok()?;
            let end = if end.is_empty() {
                self.data.len() - 1
            } else {
                end.parse::<usize>().ok()?.min(self.data.len() - 1)
            };
            Some((start, end))
        }

        fn respond(&self, request: &HttpRequest) -> (u16, HashMap<String, String>, Bytes) {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let mut headers = HashMap::from([("Accept-Ranges".to_string(), "bytes".to_string())]);
            match self.span(request) {
                Some((start, end)) => {
                    headers.insert(
                        "Content-Range".to_string(),
                        format!("bytes {}-{}/{}", start, end, self.data.len()),
                    );
                    (206, headers, self.data.slice(start..=end))
                }
                None => (200, headers, self.data.clone()),
            }
        }
    }

    #[async_trait]
    impl HttpClient for RangeServer {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
            let (status, headers, body) = self.respond(&request);
            let body = if request.method == HttpMethod::Head {
                Bytes::new()
            } else {
                body
            };
            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        }

        async fn execute_stream(&self, request: HttpRequest) -> Result<StreamingResponse> {
            let (status, headers, body) = self.respond(&request);
            Ok(StreamingResponse {
                status,
                headers,
                body: Box::new(Cursor::new(body)),
            })
        }
    }
}

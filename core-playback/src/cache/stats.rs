//! Cache statistics and monitoring

use serde::Serialize;

use super::state::BufferingState;
use super::strategy::DownloadStrategy;

/// Point-in-time statistics of one stream cache.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Strategy in use, once determined.
    pub strategy: Option<DownloadStrategy>,

    pub state: BufferingState,

    /// Number of chunks currently cached
    pub cached_chunks: usize,

    pub total_chunks: usize,

    /// Bytes held in the chunk store
    pub cached_bytes: u64,

    pub total_bytes: u64,

    /// Every chunk is cached.
    pub fully_cached: bool,

    /// Chunks queued by the scheduler
    pub pending_requests: usize,

    /// Chunks being fetched right now
    pub in_flight_requests: usize,

    /// Predictive prefetch segments created so far
    pub prefetch_segments: usize,

    /// Whole-resource download progress, 0.0 to 1.0
    pub download_progress: f64,
}

impl CacheStats {
    /// Calculate the cached share of the resource as a percentage.
    pub fn usage_percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }

        (self.cached_bytes as f64 / self.total_bytes as f64) * 100.0
    }

    /// Chunks still missing.
    pub fn missing_chunks(&self) -> usize {
        self.total_chunks.saturating_sub(self.cached_chunks)
    }
}

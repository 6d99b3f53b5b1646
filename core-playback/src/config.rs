//! # Stream Cache Configuration
//!
//! Configuration types for the adaptive streaming chunk cache.

use bridge_traits::http::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cache::strategy::DownloadStrategy;

/// Stream cache configuration.
///
/// Controls chunk geometry, the hot window, concurrency limits, retry and
/// timeout behaviour, and the speculative features (tail fetch, prefetch).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamCacheConfig {
    /// Size of every chunk except the last (in bytes).
    ///
    /// Default: 256 KiB.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Chunks kept hot behind the playback cursor.
    ///
    /// Default: 2.
    #[serde(default = "default_behind_chunks")]
    pub behind_chunks: usize,

    /// Chunks kept hot ahead of the playback cursor.
    ///
    /// Default: 6.
    #[serde(default = "default_ahead_chunks")]
    pub ahead_chunks: usize,

    /// Contiguous chunks from the playback position required for playback-grade health.
    ///
    /// Default: 3.
    #[serde(default = "default_min_ready_chunks")]
    pub min_ready_chunks: usize,

    /// Worker pool size for scheduled and urgent chunk fetches.
    ///
    /// Default: 8.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Connections used by the parallel whole-resource download.
    ///
    /// Default: 4.
    #[serde(default = "default_parallel_connections")]
    pub parallel_connections: usize,

    /// Pause inserted every `parallel_connections` launches.
    ///
    /// Default: 200 ms.
    #[serde(default = "default_parallel_stagger")]
    pub parallel_stagger: Duration,

    /// Largest resource downloaded in parallel when the server refuses ranges.
    ///
    /// Default: 50 MiB.
    #[serde(default = "default_parallel_max_size")]
    pub parallel_max_size: u64,

    /// Interval between health polls while waiting for data.
    ///
    /// Default: 120 ms.
    #[serde(default = "default_health_poll_interval")]
    pub health_poll_interval: Duration,

    /// Time allowed for the first chunk during initialization.
    ///
    /// Default: 10 seconds.
    #[serde(default = "default_chunk0_timeout")]
    pub chunk0_timeout: Duration,

    /// Per-request timeout for a single chunk body.
    ///
    /// Default: 15 seconds.
    #[serde(default = "default_chunk_body_timeout")]
    pub chunk_body_timeout: Duration,

    /// Upper bound for blocking or polling reads waiting on missing data.
    ///
    /// Default: 30 seconds.
    #[serde(default = "default_read_wait_timeout")]
    pub read_wait_timeout: Duration,

    /// Retry behaviour for chunk requests.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Chunks fetched from the end of the resource at startup.
    ///
    /// Default: 2.
    #[serde(default = "default_tail_chunk_count")]
    pub tail_chunk_count: usize,

    /// Chunks handed to the tail cache once the whole resource is cached.
    ///
    /// Default: 4.
    #[serde(default = "default_tail_track_chunks")]
    pub tail_track_chunks: usize,

    /// Seek position (fraction of the resource) beyond which the final chunks are requested eagerly.
    ///
    /// Default: 0.90.
    #[serde(default = "default_seek_tail_threshold")]
    pub seek_tail_threshold: f64,

    /// Final chunks requested by a seek past `seek_tail_threshold`.
    ///
    /// Default: 3.
    #[serde(default = "default_seek_tail_chunks")]
    pub seek_tail_chunks: usize,

    /// Playback fraction beyond which the hot window stretches to the last chunk.
    ///
    /// Default: 0.85.
    #[serde(default = "default_near_end_threshold")]
    pub near_end_threshold: f64,

    /// Probe the server for range support before choosing a strategy.
    ///
    /// Default: true.
    #[serde(default = "default_probe_range_support")]
    pub probe_range_support: bool,

    /// Skip probing and always use this strategy.
    #[serde(default)]
    pub forced_strategy: Option<DownloadStrategy>,

    /// Predictive prefetch settings.
    #[serde(default)]
    pub prefetch: PrefetchConfig,
}

impl Default for StreamCacheConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            behind_chunks: default_behind_chunks(),
            ahead_chunks: default_ahead_chunks(),
            min_ready_chunks: default_min_ready_chunks(),
            max_concurrency: default_max_concurrency(),
            parallel_connections: default_parallel_connections(),
            parallel_stagger: default_parallel_stagger(),
            parallel_max_size: default_parallel_max_size(),
            health_poll_interval: default_health_poll_interval(),
            chunk0_timeout: default_chunk0_timeout(),
            chunk_body_timeout: default_chunk_body_timeout(),
            read_wait_timeout: default_read_wait_timeout(),
            retry: RetryConfig::default(),
            tail_chunk_count: default_tail_chunk_count(),
            tail_track_chunks: default_tail_track_chunks(),
            seek_tail_threshold: default_seek_tail_threshold(),
            seek_tail_chunks: default_seek_tail_chunks(),
            near_end_threshold: default_near_end_threshold(),
            probe_range_support: default_probe_range_support(),
            forced_strategy: None,
            prefetch: PrefetchConfig::default(),
        }
    }
}

impl StreamCacheConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration tuned for fast startup on good connections.
    ///
    /// - Smaller chunks (128 KiB) so chunk 0 lands sooner
    /// - Wider look-ahead window
    /// - Shorter startup timeout
    pub fn low_latency() -> Self {
        Self {
            chunk_size: 128 * 1024,
            ahead_chunks: 10,
            min_ready_chunks: 2,
            chunk0_timeout: Duration::from_secs(5),
            health_poll_interval: Duration::from_millis(60),
            ..Default::default()
        }
    }

    /// Configuration for metered or rate-limited servers.
    ///
    /// - Fewer connections, no predictive prefetch
    /// - Longer timeouts
    pub fn conservative() -> Self {
        Self {
            max_concurrency: 2,
            parallel_connections: 2,
            ahead_chunks: 4,
            chunk0_timeout: Duration::from_secs(20),
            chunk_body_timeout: Duration::from_secs(30),
            prefetch: PrefetchConfig {
                enabled: false,
                ..PrefetchConfig::default()
            },
            ..Default::default()
        }
    }

    /// Set chunk size.
    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Set the hot window bounds.
    pub fn with_window(mut self, behind: usize, ahead: usize) -> Self {
        self.behind_chunks = behind;
        self.ahead_chunks = ahead;
        self
    }

    /// Set worker pool size.
    pub fn with_max_concurrency(mut self, count: usize) -> Self {
        self.max_concurrency = count;
        self
    }

    /// Set the parallel whole-resource download shape.
    pub fn with_parallel(mut self, connections: usize, stagger: Duration) -> Self {
        self.parallel_connections = connections;
        self.parallel_stagger = stagger;
        self
    }

    /// Set startup timeout.
    pub fn with_chunk0_timeout(mut self, timeout: Duration) -> Self {
        self.chunk0_timeout = timeout;
        self
    }

    /// Set health poll interval.
    pub fn with_health_poll_interval(mut self, interval: Duration) -> Self {
        self.health_poll_interval = interval;
        self
    }

    /// Set read wait bound.
    pub fn with_read_wait_timeout(mut self, timeout: Duration) -> Self {
        self.read_wait_timeout = timeout;
        self
    }

    /// Set retry behaviour.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Force a download strategy and skip probing.
    pub fn with_forced_strategy(mut self, strategy: DownloadStrategy) -> Self {
        self.forced_strategy = Some(strategy);
        self
    }

    /// Set prefetch settings.
    pub fn with_prefetch(mut self, prefetch: PrefetchConfig) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk_size must be > 0".to_string());
        }

        if self.min_ready_chunks == 0 {
            return Err("min_ready_chunks must be at least 1".to_string());
        }

        if self.max_concurrency == 0 {
            return Err("max_concurrency must be at least 1".to_string());
        }

        if self.parallel_connections == 0 {
            return Err("parallel_connections must be at least 1".to_string());
        }

        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }

        if self.retry.min_delay > self.retry.max_delay {
            return Err("retry.min_delay cannot exceed retry.max_delay".to_string());
        }

        if !(0.0..=1.0).contains(&self.seek_tail_threshold) {
            return Err("seek_tail_threshold must be between 0.0 and 1.0".to_string());
        }

        if !(0.0..=1.0).contains(&self.near_end_threshold) {
            return Err("near_end_threshold must be between 0.0 and 1.0".to_string());
        }

        if self.health_poll_interval.is_zero() {
            return Err("health_poll_interval must be > 0".to_string());
        }

        self.prefetch.validate()
    }
}

/// Retry settings for a single chunk request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts before giving up on a chunk.
    ///
    /// Default: 5.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff base, doubled per attempt.
    ///
    /// Default: 300 ms.
    #[serde(default = "default_base_delay")]
    pub base_delay: Duration,

    /// Lower clamp for any backoff, including `Retry-After`.
    ///
    /// Default: 200 ms.
    #[serde(default = "default_min_delay")]
    pub min_delay: Duration,

    /// Upper clamp for any backoff.
    ///
    /// Default: 30 seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            min_delay: default_min_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryConfig {
    /// Immediate retries, for tests and local servers.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            min_delay: self.min_delay,
            max_delay: self.max_delay,
            use_exponential_backoff: true,
        }
    }
}

/// Predictive prefetch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchConfig {
    /// Whether the prefetcher runs at all.
    ///
    /// Default: true.
    #[serde(default = "default_prefetch_enabled")]
    pub enabled: bool,

    /// Offsets warmed, in order, as fractions of the resource.
    ///
    /// Default: 0.25, 0.50, 0.75.
    #[serde(default = "default_prefetch_ratios")]
    pub ratios: Vec<f64>,

    /// Chunks downloaded per segment.
    ///
    /// Default: 10.
    #[serde(default = "default_chunks_per_segment")]
    pub chunks_per_segment: usize,

    /// Smallest resource worth prefetching.
    ///
    /// Default: 100 MiB.
    #[serde(default = "default_prefetch_min_resource_size")]
    pub min_resource_size: u64,

    /// Chunks a segment needs before it can serve a lookup.
    ///
    /// Default: 3.
    #[serde(default = "default_min_chunks_for_hit")]
    pub min_chunks_for_hit: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: default_prefetch_enabled(),
            ratios: default_prefetch_ratios(),
            chunks_per_segment: default_chunks_per_segment(),
            min_resource_size: default_prefetch_min_resource_size(),
            min_chunks_for_hit: default_min_chunks_for_hit(),
        }
    }
}

impl PrefetchConfig {
    /// Prefetching switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.ratios.iter().any(|r| !(0.0..1.0).contains(r)) {
            return Err("prefetch ratios must be in [0.0, 1.0)".to_string());
        }

        if self.enabled && self.chunks_per_segment == 0 {
            return Err("prefetch.chunks_per_segment must be > 0".to_string());
        }

        Ok(())
    }
}

// ============================================================================
// Default Functions (for serde)
// ============================================================================

fn default_chunk_size() -> usize {
    256 * 1024 // 256 KiB
}

fn default_behind_chunks() -> usize {
    2
}

fn default_ahead_chunks() -> usize {
    6
}

fn default_min_ready_chunks() -> usize {
    3
}

fn default_max_concurrency() -> usize {
    8
}

fn default_parallel_connections() -> usize {
    4
}

fn default_parallel_stagger() -> Duration {
    Duration::from_millis(200)
}

fn default_parallel_max_size() -> u64 {
    50 * 1024 * 1024 // 50 MiB
}

fn default_health_poll_interval() -> Duration {
    Duration::from_millis(120)
}

fn default_chunk0_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_chunk_body_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_read_wait_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_tail_chunk_count() -> usize {
    2
}

fn default_tail_track_chunks() -> usize {
    4
}

fn default_seek_tail_threshold() -> f64 {
    0.90
}

fn default_seek_tail_chunks() -> usize {
    3
}

fn default_near_end_threshold() -> f64 {
    0.85
}

fn default_probe_range_support() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> Duration {
    Duration::from_millis(300)
}

fn default_min_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_prefetch_enabled() -> bool {
    true
}

fn default_prefetch_ratios() -> Vec<f64> {
    vec![0.25, 0.50, 0.75]
}

fn default_chunks_per_segment() -> usize {
    10
}

fn default_prefetch_min_resource_size() -> u64 {
    100 * 1024 * 1024 // 100 MiB
}

fn default_min_chunks_for_hit() -> usize {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StreamCacheConfig::default();
        assert_eq!(config.chunk_size, 256 * 1024);
        assert_eq!(config.behind_chunks, 2);
        assert_eq!(config.ahead_chunks, 6);
        assert_eq!(config.min_ready_chunks, 3);
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.prefetch.ratios, vec![0.25, 0.50, 0.75]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(StreamCacheConfig::low_latency().validate().is_ok());
        assert!(StreamCacheConfig::conservative().validate().is_ok());
        assert!(!StreamCacheConfig::conservative().prefetch.enabled);
    }

    #[test]
    fn test_config_builder() {
        let config = StreamCacheConfig::new()
            .with_chunk_size(1000)
            .with_window(1, 4)
            .with_max_concurrency(3)
            .with_forced_strategy(DownloadStrategy::SequentialFull);

        assert_eq!(config.chunk_size, 1000);
        assert_eq!(config.behind_chunks, 1);
        assert_eq!(config.ahead_chunks, 4);
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.forced_strategy, Some(DownloadStrategy::SequentialFull));
    }

    #[test]
    fn test_config_validation() {
        assert!(StreamCacheConfig::new().with_chunk_size(0).validate().is_err());
        assert!(StreamCacheConfig::new().with_max_concurrency(0).validate().is_err());

        let mut bad_threshold = StreamCacheConfig::default();
        bad_threshold.seek_tail_threshold = 1.5;
        assert!(bad_threshold.validate().is_err());

        let bad_prefetch = StreamCacheConfig::new().with_prefetch(PrefetchConfig {
            ratios: vec![0.5, 1.0],
            ..PrefetchConfig::default()
        });
        assert!(bad_prefetch.validate().is_err());
    }

    #[test]
    fn test_retry_policy_conversion() {
        let policy = RetryConfig::default().to_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_for_attempt(1, None), Duration::from_millis(600));

        let immediate = RetryConfig::immediate(2).to_policy();
        assert_eq!(immediate.delay_for_attempt(3, None), Duration::ZERO);
    }

    #[test]
    fn test_serde_fills_defaults() {
        let config: StreamCacheConfig =
            serde_json::from_str(r#"{ "chunk_size": 65536, "forced_strategy": "range_requests" }"#)
                .unwrap();
        assert_eq!(config.chunk_size, 65536);
        assert_eq!(config.ahead_chunks, 6);
        assert_eq!(config.forced_strategy, Some(DownloadStrategy::RangeRequests));
        assert_eq!(config.retry.base_delay, Duration::from_millis(300));
    }
}

//! # Stream Cache Module
//!
//! Adaptive chunk cache that turns a remote resource (audio or video file
//! behind an HTTP URL) into a locally buffered, randomly readable stream.
//!
//! ## Overview
//!
//! This module handles:
//! - Download strategy selection (range requests, parallel or sequential whole-file)
//! - Playback-aware priority scheduling around the current position
//! - Urgent fetches for first chunk, seeks and read misses
//! - Predictive prefetch of likely seek targets
//! - A shared, memory-bounded cache of resource tails
//! - Buffering state and health reporting

pub mod cache;
pub mod config;
pub mod error;

pub use cache::{
    BufferingState, CacheHealthInfo, CacheReader, CacheStats, DownloadStrategy,
    StrategyCache, StreamCacheBuilder, StreamCacheManager, TailCache,
};
pub use config::{PrefetchConfig, RetryConfig, StreamCacheConfig};
pub use error::{PlaybackError, Result};

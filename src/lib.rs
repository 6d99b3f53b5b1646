//! Workspace facade crate.
//!
//! Re-exports the stream cache and its runtime pieces so host applications
//! can depend on one crate. The `desktop-shims` feature (on by default) adds
//! the reqwest-backed [`HttpClient`](bridge_traits::HttpClient).

pub use bridge_traits;
pub use core_playback;
pub use core_runtime;

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop;

pub use core_playback::{StreamCacheConfig, StreamCacheManager, TailCache};

//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest` with rustls; streaming bodies are exposed as
//!   `tokio::io::AsyncRead` through `tokio_util::io::StreamReader`
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use bridge_desktop::ReqwestHttpClient;
//! use bridge_traits::HttpClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new()?);
//!     // Hand `http` to the streaming cache
//!     Ok(())
//! }
//! ```

mod http;

pub use http::ReqwestHttpClient;

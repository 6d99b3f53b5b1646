//! # Host Bridge Traits
//!
//! Transport abstraction implemented by each host platform.
//!
//! ## Overview
//!
//! The streaming cache never talks to a concrete HTTP library. It issues
//! [`HttpRequest`](http::HttpRequest)s through the [`HttpClient`](http::HttpClient)
//! trait and the host injects an implementation (`bridge-desktop` ships one
//! built on reqwest).
//!
//! ## Traits
//!
//! - [`HttpClient`](http::HttpClient) - buffered and streaming HTTP requests
//!
//! ## Error Handling
//!
//! Implementations convert their native errors into
//! [`BridgeError`](error::BridgeError). Non-2xx statuses are reported through the
//! response, not as errors, so callers can inspect `Retry-After` and friends.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds to support safe concurrent usage
//! across async tasks.
//!
//! ## Examples
//!
//! ### Implementing HttpClient
//!
//! ```ignore
//! use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse, StreamingResponse};
//! use bridge_traits::error::Result;
//!
//! struct MyHttpClient;
//!
//! #[async_trait::async_trait]
//! impl HttpClient for MyHttpClient {
//!     async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
//!         // Platform-specific implementation
//!         todo!()
//!     }
//!
//!     async fn execute_stream(&self, request: HttpRequest) -> Result<StreamingResponse> {
//!         todo!()
//!     }
//! }
//! ```

pub mod error;
pub mod http;

pub use error::BridgeError;
pub use http::{
    HttpBodyStream, HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy,
    StreamingResponse,
};

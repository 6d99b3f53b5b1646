//! Shared fixtures for the stream cache integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result};
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, StreamingResponse};
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Deterministic payload so any byte can be checked by offset.
pub fn byte_at(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// In-memory HTTP origin with switchable behaviour.
pub struct MockTransport {
    data: Bytes,
    supports_range: bool,
    fail_ranged_gets: AtomicBool,
    offline: AtomicBool,
    latency: Duration,
    requests: AtomicUsize,
    ranged_requests: AtomicUsize,
}

impl MockTransport {
    pub fn new(len: usize) -> Self {
        Self {
            data: Bytes::from((0..len as u64).map(byte_at).collect::<Vec<u8>>()),
            supports_range: true,
            fail_ranged_gets: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            latency: Duration::ZERO,
            requests: AtomicUsize::new(0),
            ranged_requests: AtomicUsize::new(0),
        }
    }

    /// Origin that ignores `Range` and always serves the whole body.
    pub fn without_ranges(mut self) -> Self {
        self.supports_range = false;
        self
    }

    /// Answer every request carrying a `Range` header with 503.
    pub fn failing_ranged_gets(self) -> Self {
        self.fail_ranged_gets.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn url(&self) -> &'static str {
        "https://cdn.example.com/audio/track-01.flac"
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn ranged_request_count(&self) -> usize {
        self.ranged_requests.load(Ordering::SeqCst)
    }

    fn parse_range(&self, request: &HttpRequest) -> Option<(usize, usize)> {
        let value = request.headers.get("Range")?.strip_prefix("bytes=")?;
        let (start, end) = value.split_once('-')?;
        let last = self.data.len() - 1;
        let start: usize = start.parse().ok()?;
        let end = if end.is_empty() {
            last
        } else {
            end.parse::<usize>().ok()?.min(last)
        };
        Some((start, end))
    }

    async fn respond(&self, request: &HttpRequest) -> Result<(u16, HashMap<String, String>, Bytes)> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(BridgeError::OperationFailed("connection refused".to_string()));
        }

        let mut headers = HashMap::new();
        headers.insert("Content-Length".to_string(), self.data.len().to_string());

        let ranged = request.headers.contains_key("Range");
        if ranged {
            self.ranged_requests.fetch_add(1, Ordering::SeqCst);
            if self.fail_ranged_gets.load(Ordering::SeqCst) && request.method == HttpMethod::Get {
                return Ok((503, HashMap::new(), Bytes::new()));
            }
        }

        if !self.supports_range {
            return Ok((200, headers, self.data.clone()));
        }

        headers.insert("Accept-Ranges".to_string(), "bytes".to_string());
        match self.parse_range(request) {
            Some((start, end)) => {
                headers.insert(
                    "Content-Range".to_string(),
                    format!("bytes {}-{}/{}", start, end, self.data.len()),
                );
                headers.insert("Content-Length".to_string(), (end - start + 1).to_string());
                Ok((206, headers, self.data.slice(start..=end)))
            }
            None => Ok((200, headers, self.data.clone())),
        }
    }
}

#[async_trait]
impl HttpClient for MockTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let (status, headers, body) = self.respond(&request).await?;
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
        let (status, headers, body) = self.respond(&request).await?;
        Ok(StreamingResponse {
            status,
            headers,
            body: Box::new(Cursor::new(body)),
        })
    }
}

/// Poll `check` every 10 ms for up to five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

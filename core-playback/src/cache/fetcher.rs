//! Range fetcher: single chunks with retry, and whole-resource downloads.

use bridge_traits::http::{HttpBodyStream, HttpClient, HttpRequest, HttpResponse, RetryPolicy};
use bytes::Bytes;
use core_runtime::logging::redact_url;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::chunk::ResourceDescriptor;
use crate::error::{PlaybackError, Result};

/// Downloads chunks of one resource.
///
/// Cheap to clone; clones share the transport and descriptor.
#[derive(Clone)]
pub struct RangeFetcher {
    http: Arc<dyn HttpClient>,
    descriptor: Arc<ResourceDescriptor>,
    headers: Arc<HashMap<String, String>>,
    retry: RetryPolicy,
    body_timeout: Duration,
}

impl RangeFetcher {
    pub fn new(
        http: Arc<dyn HttpClient>,
        descriptor: Arc<ResourceDescriptor>,
        headers: HashMap<String, String>,
        retry: RetryPolicy,
        body_timeout: Duration,
    ) -> Self {
        Self {
            http,
            descriptor,
            headers: Arc::new(headers),
            retry,
            body_timeout,
        }
    }

    pub fn descriptor(&self) -> &Arc<ResourceDescriptor> {
        &self.descriptor
    }

    fn request(&self) -> HttpRequest {
        HttpRequest::get(self.descriptor.url()).headers(self.headers.iter())
    }

    /// Fetch chunk `index` with a byte-range GET, retrying with backoff.
    ///
    /// Returns exactly `expected_len(index)` bytes, `Cancelled` if the token
    /// fires, or `RetriesExhausted` once every attempt failed.
    pub async fn fetch_chunk(&self, index: usize, cancel: &CancellationToken) -> Result<Bytes> {
        self.descriptor.check_index(index)?;
        let (start, end) = self
            .descriptor
            .chunk_range(index)
            .ok_or(PlaybackError::ChunkOutOfRange {
                index,
                total: self.descriptor.total_chunks(),
            })?;

        let mut last_error = None;
        for attempt in 0..self.retry.max_attempts {
            let request = self.request().range(start, end).timeout(self.body_timeout);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PlaybackError::Cancelled),
                result = self.http.execute(request) => result,
            };

            let (error, retry_after) = match outcome {
                Ok(response) => {
                    let retry_after = response.retry_after();
                    match self.extract_chunk(index, start, response) {
                        Ok(bytes) => return Ok(bytes),
                        Err(e) => (e, retry_after),
                    }
                }
                Err(e) => (PlaybackError::from(e), None),
            };

            if attempt + 1 < self.retry.max_attempts {
                let delay = self.retry.delay_for_attempt(attempt, retry_after);
                warn!(
                    chunk = index,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    transient = error.is_transient(),
                    error = %error,
                    "Chunk fetch failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PlaybackError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            last_error = Some(error);
        }

        Err(PlaybackError::RetriesExhausted {
            index,
            attempts: self.retry.max_attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt made".to_string()),
        })
    }

    fn extract_chunk(&self, index: usize, start: u64, response: HttpResponse) -> Result<Bytes> {
        if !response.is_success() {
            return Err(PlaybackError::HttpStatus {
                status: response.status,
                what: format!("chunk {}", index),
            });
        }

        let expected = self.descriptor.expected_len(index).unwrap_or(0);
        let status = response.status;
        let body = response.body;

        if body.is_empty() {
            return Err(PlaybackError::EmptyBody(index));
        }
        if body.len() == expected {
            return Ok(body);
        }
        // Range ignored: the server sent the whole resource.
        if status == 200 && body.len() as u64 == self.descriptor.total_size() {
            let from = start as usize;
            return Ok(body.slice(from..from + expected));
        }

        Err(PlaybackError::LengthMismatch {
            index,
            expected,
            actual: body.len(),
        })
    }

    /// Stream the whole resource in one GET, emitting chunks in index order.
    ///
    /// `on_chunk` may stop the download early by returning `Break`. Returns
    /// the number of chunks emitted.
    #[instrument(skip_all, fields(url = %redact_url(self.descriptor.url())))]
    pub async fn fetch_all_sequential<F, P>(
        &self,
        mut on_chunk: F,
        on_progress: P,
        cancel: &CancellationToken,
    ) -> Result<usize>
    where
        F: FnMut(usize, Bytes) -> ControlFlow<()>,
        P: Fn(f64),
    {
        let body = self.open_stream(self.request(), "full resource", cancel).await?.1;
        self.pump_chunks(body, 0, None, &mut on_chunk, &on_progress, cancel)
            .await
    }

    /// Stream up to `max_chunks` chunks starting at `start_chunk` over one connection.
    ///
    /// Asks for an open-ended range; if the server answers with the whole
    /// resource instead, the bytes before the start are discarded.
    #[instrument(skip(self, on_chunk, cancel))]
    pub async fn fetch_span<F>(
        &self,
        start_chunk: usize,
        max_chunks: usize,
        mut on_chunk: F,
        cancel: &CancellationToken,
    ) -> Result<usize>
    where
        F: FnMut(usize, Bytes) -> ControlFlow<()>,
    {
        self.descriptor.check_index(start_chunk)?;
        let start = self.descriptor.chunk_start(start_chunk);

        let request = self.request().range_from(start);
        let (status, mut body) = self.open_stream(request, "span", cancel).await?;

        if status != 206 && start > 0 {
            debug!(skip_bytes = start, "Range ignored, skipping to span start");
            let mut skipped_body = (&mut body).take(start);
            let mut sink = tokio::io::sink();
            let skipped = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PlaybackError::Cancelled),
                copied = tokio::io::copy(&mut skipped_body, &mut sink) => copied?,
            };
            if skipped < start {
                return Err(PlaybackError::PrematureEndOfStream {
                    received: skipped,
                    expected: start,
                });
            }
        }

        self.pump_chunks(body, start_chunk, Some(max_chunks), &mut on_chunk, &|_| {}, cancel)
            .await
    }

    async fn open_stream(
        &self,
        request: HttpRequest,
        what: &str,
        cancel: &CancellationToken,
    ) -> Result<(u16, HttpBodyStream)> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PlaybackError::Cancelled),
            result = self.http.execute_stream(request) => result?,
        };

        if !response.is_success() {
            return Err(PlaybackError::HttpStatus {
                status: response.status,
                what: what.to_string(),
            });
        }

        Ok((response.status, response.body))
    }

    async fn pump_chunks<F, P>(
        &self,
        mut body: HttpBodyStream,
        first_index: usize,
        max_chunks: Option<usize>,
        on_chunk: &mut F,
        on_progress: &P,
        cancel: &CancellationToken,
    ) -> Result<usize>
    where
        F: FnMut(usize, Bytes) -> ControlFlow<()>,
        P: Fn(f64),
    {
        let total_chunks = self.descriptor.total_chunks();
        let end = max_chunks
            .map(|max| first_index.saturating_add(max).min(total_chunks))
            .unwrap_or(total_chunks);
        let mut buf = vec![0u8; self.descriptor.chunk_size()];
        let mut emitted = 0usize;

        for index in first_index..end {
            let expected = self.descriptor.expected_len(index).unwrap_or(0);

            // A short read is not end-of-stream: keep filling until full or EOF.
            let mut filled = 0usize;
            while filled < expected {
                let read = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PlaybackError::Cancelled),
                    read = tokio::time::timeout(self.body_timeout, body.read(&mut buf[filled..expected])) => read,
                };
                let n = match read {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(PlaybackError::Timeout(format!(
                            "no body data for {:?} while reading chunk {}",
                            self.body_timeout, index
                        )))
                    }
                };
                if n == 0 {
                    break;
                }
                filled += n;
            }

            if filled < expected {
                let received = self.descriptor.chunk_start(index) + filled as u64;
                warn!(
                    chunk = index,
                    received = filled,
                    expected,
                    "Stream ended inside a chunk"
                );
                if filled > 0 {
                    // The sink rejects it; emitted only so the rejection is logged in one place.
                    let _ = on_chunk(index, Bytes::copy_from_slice(&buf[..filled]));
                }
                return Err(PlaybackError::PrematureEndOfStream {
                    received,
                    expected: self.descriptor.total_size(),
                });
            }

            emitted += 1;
            let flow = on_chunk(index, Bytes::copy_from_slice(&buf[..expected]));
            on_progress((index + 1) as f64 / total_chunks as f64);
            if flow.is_break() {
                debug!(chunk = index, "Stream download stopped by consumer");
                break;
            }
        }

        Ok(emitted)
    }

    /// Fetch every chunk with at most `max_connections` requests in flight.
    ///
    /// A `stagger` pause is inserted every `max_connections` launches.
    /// Returns `Ok(true)` only if no chunk failed; callers fall back to
    /// [`fetch_all_sequential`](Self::fetch_all_sequential) otherwise.
    #[instrument(skip_all, fields(url = %redact_url(self.descriptor.url()), max_connections))]
    pub async fn fetch_all_parallel<F, P>(
        &self,
        max_connections: usize,
        stagger: Duration,
        on_chunk: F,
        on_progress: P,
        cancel: &CancellationToken,
    ) -> Result<bool>
    where
        F: Fn(usize, Bytes) + Send + Sync + 'static,
        P: Fn(f64) + Send + Sync + 'static,
    {
        let max_connections = max_connections.max(1);
        let total = self.descriptor.total_chunks();
        let semaphore = Arc::new(Semaphore::new(max_connections));
        let failures = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let on_chunk = Arc::new(on_chunk);
        let on_progress = Arc::new(on_progress);
        let mut tasks = JoinSet::new();

        for index in 0..total {
            if index > 0 && index % max_connections == 0 && !stagger.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(stagger) => {}
                }
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => permit
                    .map_err(|e| PlaybackError::Internal(format!("semaphore closed: {}", e)))?,
            };

            let fetcher = self.clone();
            let cancel = cancel.clone();
            let failures = Arc::clone(&failures);
            let completed = Arc::clone(&completed);
            let on_chunk = Arc::clone(&on_chunk);
            let on_progress = Arc::clone(&on_progress);

            tasks.spawn(async move {
                let _permit = permit;
                match fetcher.fetch_chunk(index, &cancel).await {
                    Ok(data) => {
                        on_chunk(index, data);
                        let done = completed.fetch_add(1, Ordering::AcqRel) + 1;
                        on_progress(done as f64 / total as f64);
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => {
                        warn!(chunk = index, error = %e, "Parallel chunk fetch failed");
                        failures.fetch_add(1, Ordering::AcqRel);
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Parallel fetch task aborted");
                failures.fetch_add(1, Ordering::AcqRel);
            }
        }

        if cancel.is_cancelled() {
            return Err(PlaybackError::Cancelled);
        }

        let failed = failures.load(Ordering::Acquire);
        debug!(
            completed = completed.load(Ordering::Acquire),
            failed, "Parallel download finished"
        );
        Ok(failed == 0)
    }
}

impl std::fmt::Debug for RangeFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeFetcher")
            .field("url", &redact_url(self.descriptor.url()))
            .field("retry", &self.retry)
            .finish()
    }
}

//! Download strategy selection.
//!
//! A strategy is picked once per resource, before any chunk is fetched:
//! range-capable servers get on-demand chunk scheduling, the rest get a
//! whole-resource download (parallel for small files, one stream otherwise).

use bridge_traits::http::{parse_content_range_total, HttpClient, HttpRequest};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// How a resource is downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStrategy {
    /// Chunks fetched on demand with byte-range requests.
    RangeRequests,
    /// Every chunk fetched up front over several range connections.
    ParallelFull,
    /// One streaming GET over the whole resource.
    SequentialFull,
}

impl DownloadStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStrategy::RangeRequests => "range_requests",
            DownloadStrategy::ParallelFull => "parallel_full",
            DownloadStrategy::SequentialFull => "sequential_full",
        }
    }

    /// Whether single chunks can be requested individually.
    pub fn is_range_capable(&self) -> bool {
        !matches!(self, DownloadStrategy::SequentialFull)
    }

    /// Whether the whole resource is downloaded in the background.
    pub fn is_whole_resource(&self) -> bool {
        !matches!(self, DownloadStrategy::RangeRequests)
    }
}

impl fmt::Display for DownloadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick a strategy from probe results.
pub fn select_strategy(supports_range: bool, total_size: u64, parallel_max_size: u64) -> DownloadStrategy {
    if supports_range {
        DownloadStrategy::RangeRequests
    } else if total_size <= parallel_max_size {
        DownloadStrategy::ParallelFull
    } else {
        DownloadStrategy::SequentialFull
    }
}

/// What a probe learned about the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RangeSupport {
    pub supports_range: bool,
    pub content_length: Option<u64>,
}

/// Ask the server whether it honours byte ranges.
///
/// First a `HEAD` looking for `Accept-Ranges: bytes`, then a one-byte range
/// GET expecting `206` or a `Content-Range` header. Transport errors count as
/// "no support".
pub async fn probe_range_support(
    http: &dyn HttpClient,
    url: &str,
    headers: &HashMap<String, String>,
) -> RangeSupport {
    let mut support = RangeSupport::default();

    let head = HttpRequest::head(url).headers(headers).timeout(PROBE_TIMEOUT);
    match http.execute(head).await {
        Ok(response) if response.is_success() => {
            support.content_length = response.content_length();
            let accepts = response
                .header("Accept-Ranges")
                .map(|v| v.to_ascii_lowercase().contains("bytes"))
                .unwrap_or(false);
            if accepts {
                support.supports_range = true;
                return support;
            }
        }
        Ok(response) => debug!(status = response.status, "HEAD probe rejected"),
        Err(e) => debug!(error = %e, "HEAD probe failed"),
    }

    let probe = HttpRequest::get(url)
        .headers(headers)
        .range(0, 0)
        .timeout(PROBE_TIMEOUT);
    match http.execute(probe).await {
        Ok(response) => {
            let content_range = response.header("Content-Range");
            if let Some(total) = content_range.and_then(parse_content_range_total) {
                support.content_length = Some(total);
            }
            support.supports_range = response.is_partial_content() || content_range.is_some();
        }
        Err(e) => warn!(error = %e, "Range probe failed; assuming no range support"),
    }

    support
}

/// Strategy decisions remembered per host.
///
/// Shared between orchestrators so a host is probed only once per process.
#[derive(Debug, Default)]
pub struct StrategyCache {
    by_host: DashMap<String, DownloadStrategy>,
}

impl StrategyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str) -> Option<DownloadStrategy> {
        let host = host_key(url)?;
        self.by_host.get(&host).map(|entry| *entry.value())
    }

    pub fn insert(&self, url: &str, strategy: DownloadStrategy) {
        if let Some(host) = host_key(url) {
            self.by_host.insert(host, strategy);
        }
    }

    /// Forget a host, e.g. after its CDN configuration changed.
    pub fn invalidate(&self, url: &str) {
        if let Some(host) = host_key(url) {
            self.by_host.remove(&host);
        }
    }

    pub fn len(&self) -> usize {
        self.by_host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_host.is_empty()
    }
}

fn host_key(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

//! Resource geometry: how a byte range maps onto fixed-size chunks.

use serde::{Deserialize, Serialize};

use crate::error::{PlaybackError, Result};

/// Immutable description of a remote resource split into chunks.
///
/// Every chunk is `chunk_size` bytes except the last, which holds the
/// remainder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    url: String,
    total_size: u64,
    chunk_size: usize,
    total_chunks: usize,
}

impl ResourceDescriptor {
    pub fn new(url: impl Into<String>, total_size: u64, chunk_size: usize) -> Result<Self> {
        let url = url.into();
        if url.is_empty() {
            return Err(PlaybackError::InvalidResource("empty url".to_string()));
        }
        if total_size == 0 {
            return Err(PlaybackError::InvalidResource(
                "total size must be > 0".to_string(),
            ));
        }
        if chunk_size == 0 {
            return Err(PlaybackError::InvalidResource(
                "chunk size must be > 0".to_string(),
            ));
        }

        let total_chunks = total_size.div_ceil(chunk_size as u64) as usize;

        Ok(Self {
            url,
            total_size,
            chunk_size,
            total_chunks,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    pub fn last_chunk(&self) -> usize {
        self.total_chunks - 1
    }

    /// Chunk containing `position`; positions past the end map to the last chunk.
    pub fn chunk_for(&self, position: u64) -> usize {
        let index = (position / self.chunk_size as u64) as usize;
        index.min(self.last_chunk())
    }

    /// First byte of chunk `index`.
    pub fn chunk_start(&self, index: usize) -> u64 {
        index as u64 * self.chunk_size as u64
    }

    /// Inclusive byte span of chunk `index`.
    pub fn chunk_range(&self, index: usize) -> Option<(u64, u64)> {
        let len = self.expected_len(index)?;
        let start = self.chunk_start(index);
        Some((start, start + len as u64 - 1))
    }

    /// Exact length chunk `index` must have to be stored.
    pub fn expected_len(&self, index: usize) -> Option<usize> {
        if index >= self.total_chunks {
            return None;
        }
        let start = self.chunk_start(index);
        let remaining = self.total_size - start;
        Some(remaining.min(self.chunk_size as u64) as usize)
    }

    /// Position as a fraction of the resource, in `[0, 1]`.
    pub fn fraction(&self, position: u64) -> f64 {
        (position as f64 / self.total_size as f64).clamp(0.0, 1.0)
    }

    pub(crate) fn check_index(&self, index: usize) -> Result<()> {
        if index < self.total_chunks {
            Ok(())
        } else {
            Err(PlaybackError::ChunkOutOfRange {
                index,
                total: self.total_chunks,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_with_short_last_chunk() {
        let descriptor = ResourceDescriptor::new("https://a/b", 2500, 1000).unwrap();

        assert_eq!(descriptor.total_chunks(), 3);
        assert_eq!(descriptor.expected_len(0), Some(1000));
        assert_eq!(descriptor.expected_len(2), Some(500));
        assert_eq!(descriptor.expected_len(3), None);
        assert_eq!(descriptor.chunk_range(2), Some((2000, 2499)));
        assert_eq!(descriptor.chunk_for(1999), 1);
        assert_eq!(descriptor.chunk_for(10_000), 2);
    }

    #[test]
    fn test_exact_multiple() {
        let descriptor = ResourceDescriptor::new("https://a/b", 2_560_000, 256_000).unwrap();
        assert_eq!(descriptor.total_chunks(), 10);
        assert_eq!(descriptor.expected_len(9), Some(256_000));
        assert_eq!(descriptor.chunk_range(9), Some((2_304_000, 2_559_999)));
    }

    #[test]
    fn test_rejects_degenerate_resources() {
        assert!(ResourceDescriptor::new("", 10, 1).is_err());
        assert!(ResourceDescriptor::new("https://a/b", 0, 1).is_err());
        assert!(ResourceDescriptor::new("https://a/b", 10, 0).is_err());
    }
}

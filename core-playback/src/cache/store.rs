//! Concurrent chunk store.
//!
//! The map itself is a `DashMap`, so fetch completions and readers never
//! contend on a single lock. Insertion is insert-if-absent and validated
//! against the descriptor: a chunk whose length disagrees with its index is
//! never stored, so `read_into` can never observe a torn chunk.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::chunk::ResourceDescriptor;

/// Outcome of [`ChunkStore::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
    /// Length did not match the chunk's expected length (or index out of range).
    Rejected { expected: usize, actual: usize },
}

impl InsertOutcome {
    /// Chunk is readable after the call.
    pub fn is_stored(&self) -> bool {
        !matches!(self, InsertOutcome::Rejected { .. })
    }
}

/// Receives chunks produced by a fetch path.
///
/// Returns `true` when the chunk is readable afterwards.
pub trait ChunkSink: Send + Sync {
    fn accept(&self, index: usize, data: Bytes) -> bool;
}

pub struct ChunkStore {
    descriptor: Arc<ResourceDescriptor>,
    chunks: DashMap<usize, Bytes>,
    cached_bytes: AtomicU64,
}

impl ChunkStore {
    pub fn new(descriptor: Arc<ResourceDescriptor>) -> Self {
        Self {
            descriptor,
            chunks: DashMap::new(),
            cached_bytes: AtomicU64::new(0),
        }
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    pub fn insert(&self, index: usize, data: Bytes) -> InsertOutcome {
        let Some(expected) = self.descriptor.expected_len(index) else {
            return InsertOutcome::Rejected {
                expected: 0,
                actual: data.len(),
            };
        };
        if data.len() != expected {
            return InsertOutcome::Rejected {
                expected,
                actual: data.len(),
            };
        }

        match self.chunks.entry(index) {
            Entry::Occupied(_) => InsertOutcome::AlreadyPresent,
            Entry::Vacant(slot) => {
                slot.insert(data);
                self.cached_bytes.fetch_add(expected as u64, Ordering::AcqRel);
                InsertOutcome::Inserted
            }
        }
    }

    pub fn get(&self, index: usize) -> Option<Bytes> {
        self.chunks.get(&index).map(|chunk| chunk.value().clone())
    }

    pub fn contains(&self, index: usize) -> bool {
        self.chunks.contains_key(&index)
    }

    /// Number of cached chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn cached_bytes(&self) -> u64 {
        self.cached_bytes.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.len() == self.descriptor.total_chunks()
    }

    /// Whether every chunk in `start..end` is cached.
    pub fn contains_all(&self, start: usize, end: usize) -> bool {
        (start..end).all(|index| self.contains(index))
    }

    /// Count of cached chunks in `start..end`.
    pub fn count_in(&self, start: usize, end: usize) -> usize {
        (start..end).filter(|index| self.contains(*index)).count()
    }

    /// Cached chunks among the last `count`, keyed by index.
    pub fn tail_chunks(&self, count: usize) -> Vec<(usize, Bytes)> {
        let total = self.descriptor.total_chunks();
        (total.saturating_sub(count)..total)
            .filter_map(|index| self.get(index).map(|chunk| (index, chunk)))
            .collect()
    }

    /// Copy contiguous cached bytes starting at `position` into `buf`.
    ///
    /// Stops at the first missing chunk, the end of the resource, or when
    /// `buf` is full. Returns the number of bytes copied; 0 means "not cached yet".
    pub fn read_into(&self, position: u64, buf: &mut [u8]) -> usize {
        let total = self.descriptor.total_size();
        if buf.is_empty() || position >= total {
            return 0;
        }

        let chunk_size = self.descriptor.chunk_size() as u64;
        let mut copied = 0usize;
        let mut cursor = position;

        while copied < buf.len() && cursor < total {
            let index = (cursor / chunk_size) as usize;
            let Some(chunk) = self.get(index) else {
                break;
            };

            let offset = (cursor - index as u64 * chunk_size) as usize;
            let available = chunk.len() - offset;
            let n = available.min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&chunk[offset..offset + n]);

            copied += n;
            cursor += n as u64;
        }

        copied
    }

    pub fn clear(&self) {
        self.chunks.clear();
        self.cached_bytes.store(0, Ordering::Release);
    }
}

impl ChunkSink for ChunkStore {
    fn accept(&self, index: usize, data: Bytes) -> bool {
        self.insert(index, data).is_stored()
    }
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("chunks", &self.len())
            .field("total_chunks", &self.descriptor.total_chunks())
            .field("cached_bytes", &self.cached_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(total: u64, chunk: usize) -> ChunkStore {
        ChunkStore::new(Arc::new(
            ResourceDescriptor::new("https://a/b", total, chunk).unwrap(),
        ))
    }

    fn filled(len: usize, byte: u8) -> Bytes {
        Bytes::from(vec![byte; len])
    }

    #[test]
    fn test_insert_is_idempotent() {
        let store = store(3000, 1000);

        assert_eq!(store.insert(1, filled(1000, 1)), InsertOutcome::Inserted);
        assert_eq!(store.insert(1, filled(1000, 2)), InsertOutcome::AlreadyPresent);

        assert_eq!(store.len(), 1);
        assert_eq!(store.cached_bytes(), 1000);
        assert_eq!(store.get(1).unwrap()[0], 1);
    }

    #[test]
    fn test_short_final_chunk_is_rejected() {
        let store = store(2500, 1000);

        let outcome = store.insert(2, filled(400, 7));
        assert_eq!(
            outcome,
            InsertOutcome::Rejected {
                expected: 500,
                actual: 400
            }
        );
        assert!(!store.contains(2));
        assert_eq!(store.cached_bytes(), 0);

        assert_eq!(store.insert(2, filled(500, 7)), InsertOutcome::Inserted);
        assert_eq!(store.cached_bytes(), 500);
    }

    #[test]
    fn test_out_of_range_index_is_rejected() {
        let store = store(2000, 1000);
        assert!(!store.insert(2, filled(1000, 0)).is_stored());
        assert!(store.is_empty());
    }

    #[test]
    fn test_read_stops_at_first_gap() {
        let store = store(4000, 1000);
        store.insert(0, filled(1000, 0xA));
        store.insert(1, filled(1000, 0xB));
        store.insert(3, filled(1000, 0xD));

        let mut buf = vec![0u8; 4000];
        let n = store.read_into(500, &mut buf);

        assert_eq!(n, 1500);
        assert!(buf[..500].iter().all(|b| *b == 0xA));
        assert!(buf[500..1500].iter().all(|b| *b == 0xB));
        assert_eq!(store.read_into(2000, &mut buf), 0);
    }

    #[test]
    fn test_read_respects_buffer_and_end() {
        let store = store(2500, 1000);
        store.insert(2, filled(500, 9));

        let mut small = [0u8; 100];
        assert_eq!(store.read_into(2450, &mut small), 50);
        assert_eq!(store.read_into(2500, &mut small), 0);
        assert_eq!(store.read_into(2000, &mut small), 100);
    }

    #[test]
    fn test_tail_chunks_and_counts() {
        let store = store(5000, 1000);
        store.insert(3, filled(1000, 3));
        store.insert(4, filled(1000, 4));

        let tail: Vec<usize> = store.tail_chunks(3).into_iter().map(|(i, _)| i).collect();
        assert_eq!(tail, vec![3, 4]);
        assert_eq!(store.count_in(2, 5), 2);
        assert!(store.contains_all(3, 5));
        assert!(!store.is_complete());

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.cached_bytes(), 0);
    }

    #[test]
    fn test_concurrent_duplicate_inserts_count_once() {
        let store = Arc::new(store(8000, 1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for index in 0..8 {
                        store.insert(index, filled(1000, index as u8));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 8);
        assert_eq!(store.cached_bytes(), 8000);
        assert!(store.is_complete());
    }
}

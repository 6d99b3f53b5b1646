//! Priority queue of chunk fetches derived from the hot window.
//!
//! Queue, pending index and in-flight set live behind one mutex because they
//! must change together; workers call `dequeue`/`mark_*` concurrently.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

use super::hotspot::HotWindow;
use super::store::ChunkStore;

/// Added to chunks behind the cursor so forward chunks win ties.
const BEHIND_PENALTY: i64 = 100;
/// Base priority for chunks boosted around a seek target.
const BOOST_BASE: i64 = -200;

/// Ordered by `(priority, seq, index)`, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PendingRequest {
    priority: i64,
    seq: u64,
    index: usize,
}

#[derive(Debug, Default)]
struct SchedulerState {
    queue: BTreeSet<PendingRequest>,
    pending: HashMap<usize, PendingRequest>,
    in_flight: HashSet<usize>,
    next_seq: u64,
    current: usize,
}

impl SchedulerState {
    fn upsert(&mut self, index: usize, priority: i64) {
        if let Some(existing) = self.pending.get(&index).copied() {
            if existing.priority == priority {
                return;
            }
            self.queue.remove(&existing);
            let updated = PendingRequest { priority, ..existing };
            self.queue.insert(updated);
            self.pending.insert(index, updated);
            return;
        }

        let request = PendingRequest {
            priority,
            seq: self.next_seq,
            index,
        };
        self.next_seq += 1;
        self.queue.insert(request);
        self.pending.insert(index, request);
    }

    fn remove_pending(&mut self, index: usize) {
        if let Some(request) = self.pending.remove(&index) {
            self.queue.remove(&request);
        }
    }
}

fn priority_for(index: usize, current: usize) -> i64 {
    let distance = index.abs_diff(current) as i64;
    if index < current {
        distance + BEHIND_PENALTY
    } else {
        distance
    }
}

pub struct PriorityScheduler {
    store: Arc<ChunkStore>,
    behind: usize,
    ahead: usize,
    near_end_threshold: f64,
    state: Mutex<SchedulerState>,
}

impl PriorityScheduler {
    pub fn new(store: Arc<ChunkStore>, behind: usize, ahead: usize, near_end_threshold: f64) -> Self {
        Self {
            store,
            behind,
            ahead,
            near_end_threshold,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Window for `current`, stretched to the last chunk near the end.
    pub fn window_for(&self, current: usize) -> HotWindow {
        let total = self.store.descriptor().total_chunks();
        let mut window = HotWindow::around(current, total, self.behind, self.ahead);
        if current as f64 / total as f64 >= self.near_end_threshold {
            window.end = total - 1;
        }
        window
    }

    /// Recompute scheduling intent around `current`.
    ///
    /// Missing chunks in the window are queued (or re-prioritised); pending
    /// chunks outside it are dropped. Cached data is never touched.
    pub fn update_window(&self, current: usize) {
        let window = self.window_for(current);
        let mut state = self.state.lock();
        state.current = current;

        let stale: Vec<usize> = state
            .pending
            .keys()
            .filter(|index| !window.contains(**index))
            .copied()
            .collect();
        for index in stale {
            state.remove_pending(index);
        }

        for index in window.iter() {
            if self.store.contains(index) || state.in_flight.contains(&index) {
                state.remove_pending(index);
                continue;
            }
            let boosted = state
                .pending
                .get(&index)
                .map(|r| r.priority < 0)
                .unwrap_or(false);
            if !boosted {
                state.upsert(index, priority_for(index, current));
            }
        }

        trace!(
            current,
            window_start = window.start,
            window_end = window.end,
            pending = state.pending.len(),
            "Scheduler window updated"
        );
    }

    /// Pop the most urgent chunk that still needs fetching and mark it in flight.
    pub fn dequeue(&self) -> Option<usize> {
        let mut state = self.state.lock();
        while let Some(request) = state.queue.pop_first() {
            state.pending.remove(&request.index);
            if self.store.contains(request.index) || state.in_flight.contains(&request.index) {
                continue;
            }
            state.in_flight.insert(request.index);
            return Some(request.index);
        }
        None
    }

    pub fn mark_completed(&self, index: usize) {
        self.state.lock().in_flight.remove(&index);
    }

    /// Clear in-flight status and queue the chunk again at its current priority.
    pub fn mark_failed(&self, index: usize) {
        let mut state = self.state.lock();
        if !state.in_flight.remove(&index) || self.store.contains(index) {
            return;
        }
        let priority = priority_for(index, state.current);
        state.upsert(index, priority);
    }

    /// Pull chunks within `radius` of `center` to the front of the queue.
    pub fn boost(&self, center: usize, radius: usize) {
        let last = self.store.descriptor().last_chunk();
        let start = center.saturating_sub(radius);
        let end = center.saturating_add(radius).min(last);

        let mut state = self.state.lock();
        for index in start..=end {
            if self.store.contains(index) || state.in_flight.contains(&index) {
                continue;
            }
            state.upsert(index, BOOST_BASE + index.abs_diff(center) as i64);
        }
    }

    /// Mark `index` in flight for a caller fetching it directly.
    ///
    /// Returns `false` if the chunk is cached or already being fetched.
    pub fn try_claim(&self, index: usize) -> bool {
        let mut state = self.state.lock();
        if self.store.contains(index) || state.in_flight.contains(&index) {
            return false;
        }
        state.remove_pending(index);
        state.in_flight.insert(index);
        true
    }

    pub fn is_in_flight(&self, index: usize) -> bool {
        self.state.lock().in_flight.contains(&index)
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn reset(&self) {
        *self.state.lock() = SchedulerState::default();
    }
}

impl std::fmt::Debug for PriorityScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PriorityScheduler")
            .field("current", &state.current)
            .field("pending", &state.pending.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

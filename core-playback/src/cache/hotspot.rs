//! Playback cursor and the hot window derived from it.

use parking_lot::Mutex;
use std::sync::Arc;

use super::chunk::ResourceDescriptor;

/// Inclusive chunk span around the playback cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotWindow {
    pub start: usize,
    pub end: usize,
}

impl HotWindow {
    /// `[current - behind, current + ahead]`, clamped to `[0, total - 1]`.
    pub fn around(current: usize, total_chunks: usize, behind: usize, ahead: usize) -> Self {
        let last = total_chunks.saturating_sub(1);
        let current = current.min(last);
        Self {
            start: current.saturating_sub(behind),
            end: current.saturating_add(ahead).min(last),
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        (self.start..=self.end).contains(&index)
    }

    pub fn iter(&self) -> std::ops::RangeInclusive<usize> {
        self.start..=self.end
    }
}

/// Tracks the playback byte position.
#[derive(Debug)]
pub struct HotspotTracker {
    descriptor: Arc<ResourceDescriptor>,
    position: Mutex<u64>,
    behind: usize,
    ahead: usize,
}

impl HotspotTracker {
    pub fn new(descriptor: Arc<ResourceDescriptor>, behind: usize, ahead: usize) -> Self {
        Self {
            descriptor,
            position: Mutex::new(0),
            behind,
            ahead,
        }
    }

    /// Incremental update from ordinary playback progression.
    pub fn set_position(&self, position: u64) {
        *self.position.lock() = position.min(self.descriptor.total_size());
    }

    /// Immediate jump after a seek.
    pub fn shift_to(&self, position: u64) {
        self.set_position(position);
    }

    pub fn position(&self) -> u64 {
        *self.position.lock()
    }

    pub fn current_chunk(&self) -> usize {
        self.descriptor.chunk_for(self.position())
    }

    pub fn hot_window(&self) -> HotWindow {
        HotWindow::around(
            self.current_chunk(),
            self.descriptor.total_chunks(),
            self.behind,
            self.ahead,
        )
    }

    /// Absolute distance in chunks from the cursor.
    pub fn distance_to(&self, index: usize) -> usize {
        self.current_chunk().abs_diff(index)
    }

    pub fn is_in_hot_window(&self, index: usize) -> bool {
        self.hot_window().contains(index)
    }

    /// Playback progress through the resource, in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        self.descriptor.fraction(self.position())
    }

    pub fn behind(&self) -> usize {
        self.behind
    }

    pub fn ahead(&self) -> usize {
        self.ahead
    }

    pub fn reset(&self) {
        *self.position.lock() = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(total: u64) -> HotspotTracker {
        HotspotTracker::new(
            Arc::new(ResourceDescriptor::new("https://a/b", total, 1000).unwrap()),
            2,
            6,
        )
    }

    #[test]
    fn test_window_is_clamped_at_start() {
        let tracker = tracker(20_000);
        assert_eq!(tracker.hot_window(), HotWindow { start: 0, end: 6 });

        tracker.set_position(1500);
        assert_eq!(tracker.current_chunk(), 1);
        assert_eq!(tracker.hot_window(), HotWindow { start: 0, end: 7 });
    }

    #[test]
    fn test_window_is_clamped_at_end() {
        let tracker = tracker(20_000);
        tracker.shift_to(17_000);
        assert_eq!(tracker.hot_window(), HotWindow { start: 15, end: 19 });
        assert!(tracker.is_in_hot_window(19));
        assert!(!tracker.is_in_hot_window(14));
    }

    #[test]
    fn test_distance_and_overshoot() {
        let tracker = tracker(10_000);
        tracker.set_position(4_200);
        assert_eq!(tracker.distance_to(1), 3);
        assert_eq!(tracker.distance_to(9), 5);

        tracker.set_position(u64::MAX);
        assert_eq!(tracker.current_chunk(), 9);
        assert_eq!(tracker.fraction(), 1.0);

        tracker.reset();
        assert_eq!(tracker.position(), 0);
    }

    #[test]
    fn test_single_chunk_resource() {
        let window = HotWindow::around(0, 1, 2, 6);
        assert_eq!(window, HotWindow { start: 0, end: 0 });
        assert_eq!(window.iter().count(), 1);
    }
}

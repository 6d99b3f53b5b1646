//! Bandwidth allocation between connection classes.
//!
//! Ratios are a priority signal only. Nothing here throttles sockets; the
//! prefetcher consults [`BandwidthAllocator::activate_pre_cache`] to decide
//! whether speculative downloads may run at all.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;

/// Precache slots that may be active at the same time.
pub const PRE_CACHE_SLOTS: usize = 3;

const MAIN_RATIO: f64 = 0.70;
const PRE_CACHE_RATIO: f64 = 0.30;
const SEEK_RATIO: f64 = 0.90;
const MAIN_DURING_SEEK_RATIO: f64 = 0.10;

/// Logical connection class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionClass {
    MainPlayback,
    FastSeek,
    PreCache,
}

impl fmt::Display for ConnectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionClass::MainPlayback => "main_playback",
            ConnectionClass::FastSeek => "fast_seek",
            ConnectionClass::PreCache => "pre_cache",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SlotState {
    pub active: bool,
    pub ratio: f64,
    pub bytes_transferred: u64,
}

#[derive(Debug, Default)]
struct Slots {
    main: SlotState,
    seek: SlotState,
    pre_cache: [SlotState; PRE_CACHE_SLOTS],
    /// Seeks in progress; the seek slot stays active until the last one ends.
    seeks: usize,
}

impl Slots {
    fn rebalance(&mut self) {
        let active_pre_cache = self.pre_cache.iter().filter(|s| s.active).count();

        if self.seek.active {
            self.seek.ratio = SEEK_RATIO;
            self.main.ratio = if self.main.active {
                MAIN_DURING_SEEK_RATIO
            } else {
                0.0
            };
            for slot in &mut self.pre_cache {
                slot.ratio = 0.0;
            }
        } else if self.main.active {
            self.main.ratio = MAIN_RATIO;
            self.seek.ratio = 0.0;
            for slot in &mut self.pre_cache {
                slot.ratio = if slot.active {
                    PRE_CACHE_RATIO / active_pre_cache as f64
                } else {
                    0.0
                };
            }
        } else {
            self.main.ratio = 0.0;
            self.seek.ratio = 0.0;
            for slot in &mut self.pre_cache {
                slot.ratio = 0.0;
            }
        }
    }
}

/// Point-in-time view of every slot.
#[derive(Debug, Clone, Serialize)]
pub struct BandwidthSnapshot {
    pub main: SlotState,
    pub seek: SlotState,
    pub pre_cache: Vec<SlotState>,
}

impl BandwidthSnapshot {
    pub fn total_transferred(&self) -> u64 {
        self.main.bytes_transferred
            + self.seek.bytes_transferred
            + self
                .pre_cache
                .iter()
                .map(|s| s.bytes_transferred)
                .sum::<u64>()
    }
}

/// Tracks which connection classes are active and their quota ratios.
#[derive(Debug, Default)]
pub struct BandwidthAllocator {
    slots: Mutex<Slots>,
}

impl BandwidthAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate_main(&self) {
        let mut slots = self.slots.lock();
        slots.main.active = true;
        slots.rebalance();
    }

    /// Stops main playback; precache slots go with it.
    pub fn deactivate_main(&self) {
        let mut slots = self.slots.lock();
        slots.main.active = false;
        for slot in &mut slots.pre_cache {
            slot.active = false;
        }
        slots.rebalance();
    }

    /// Seek always wins: every precache slot is released.
    ///
    /// Calls nest; each must be paired with [`Self::deactivate_seek`].
    pub fn activate_seek(&self) {
        let mut slots = self.slots.lock();
        slots.seeks += 1;
        slots.seek.active = true;
        for slot in &mut slots.pre_cache {
            slot.active = false;
        }
        slots.rebalance();
    }

    pub fn deactivate_seek(&self) {
        let mut slots = self.slots.lock();
        slots.seeks = slots.seeks.saturating_sub(1);
        slots.seek.active = slots.seeks > 0;
        slots.rebalance();
    }

    /// Claim a precache slot.
    ///
    /// Refused while main playback is inactive, while a seek is active, or
    /// when every slot is taken.
    pub fn activate_pre_cache(&self) -> Option<usize> {
        let mut slots = self.slots.lock();
        if !slots.main.active || slots.seek.active {
            return None;
        }
        let index = slots.pre_cache.iter().position(|s| !s.active)?;
        slots.pre_cache[index].active = true;
        slots.rebalance();
        Some(index)
    }

    pub fn deactivate_pre_cache(&self, index: usize) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.pre_cache.get_mut(index) {
            slot.active = false;
        }
        slots.rebalance();
    }

    /// Ratio currently granted to `class`; for precache, the sum over active slots.
    pub fn ratio_for(&self, class: ConnectionClass) -> f64 {
        let slots = self.slots.lock();
        match class {
            ConnectionClass::MainPlayback => slots.main.ratio,
            ConnectionClass::FastSeek => slots.seek.ratio,
            ConnectionClass::PreCache => slots.pre_cache.iter().map(|s| s.ratio).sum(),
        }
    }

    pub fn slot_ratio(&self, index: usize) -> f64 {
        self.slots
            .lock()
            .pre_cache
            .get(index)
            .map(|s| s.ratio)
            .unwrap_or(0.0)
    }

    pub fn is_active(&self, class: ConnectionClass) -> bool {
        let slots = self.slots.lock();
        match class {
            ConnectionClass::MainPlayback => slots.main.active,
            ConnectionClass::FastSeek => slots.seek.active,
            ConnectionClass::PreCache => slots.pre_cache.iter().any(|s| s.active),
        }
    }

    /// Account bytes moved on behalf of `class`.
    ///
    /// Precache bytes are attributed to the first active slot.
    pub fn record_transfer(&self, class: ConnectionClass, bytes: u64) {
        let mut slots = self.slots.lock();
        let slot = match class {
            ConnectionClass::MainPlayback => Some(&mut slots.main),
            ConnectionClass::FastSeek => Some(&mut slots.seek),
            ConnectionClass::PreCache => slots.pre_cache.iter_mut().find(|s| s.active),
        };
        if let Some(slot) = slot {
            slot.bytes_transferred = slot.bytes_transferred.saturating_add(bytes);
        }
    }

    pub fn snapshot(&self) -> BandwidthSnapshot {
        let slots = self.slots.lock();
        BandwidthSnapshot {
            main: slots.main,
            seek: slots.seek,
            pre_cache: slots.pre_cache.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_nothing_active_is_all_zero() {
        let allocator = BandwidthAllocator::new();
        assert_eq!(allocator.ratio_for(ConnectionClass::MainPlayback), 0.0);
        assert_eq!(allocator.ratio_for(ConnectionClass::FastSeek), 0.0);
        assert_eq!(allocator.ratio_for(ConnectionClass::PreCache), 0.0);
    }

    #[test]
    fn test_pre_cache_requires_main() {
        let allocator = BandwidthAllocator::new();
        assert_eq!(allocator.activate_pre_cache(), None);

        allocator.activate_main();
        assert_eq!(allocator.activate_pre_cache(), Some(0));
        assert_eq!(allocator.activate_pre_cache(), Some(1));

        assert!(approx(allocator.ratio_for(ConnectionClass::MainPlayback), 0.70));
        assert!(approx(allocator.ratio_for(ConnectionClass::PreCache), 0.30));
        assert!(approx(allocator.slot_ratio(0), 0.15));
    }

    #[test]
    fn test_slot_limit() {
        let allocator = BandwidthAllocator::new();
        allocator.activate_main();
        for expected in 0..PRE_CACHE_SLOTS {
            assert_eq!(allocator.activate_pre_cache(), Some(expected));
        }
        assert_eq!(allocator.activate_pre_cache(), None);

        allocator.deactivate_pre_cache(1);
        assert_eq!(allocator.activate_pre_cache(), Some(1));
    }

    #[test]
    fn test_seek_preempts_pre_cache() {
        let allocator = BandwidthAllocator::new();
        allocator.activate_main();
        allocator.activate_pre_cache();

        allocator.activate_seek();
        assert!(approx(allocator.ratio_for(ConnectionClass::FastSeek), 0.90));
        assert!(approx(allocator.ratio_for(ConnectionClass::MainPlayback), 0.10));
        assert_eq!(allocator.ratio_for(ConnectionClass::PreCache), 0.0);
        assert!(!allocator.is_active(ConnectionClass::PreCache));
        assert_eq!(allocator.activate_pre_cache(), None);

        allocator.deactivate_seek();
        assert!(approx(allocator.ratio_for(ConnectionClass::MainPlayback), 0.70));
        assert_eq!(allocator.activate_pre_cache(), Some(0));
    }

    #[test]
    fn test_overlapping_seeks_hold_seek_slot() {
        let allocator = BandwidthAllocator::new();
        allocator.activate_main();

        allocator.activate_seek();
        allocator.activate_seek();
        allocator.deactivate_seek();
        assert!(allocator.is_active(ConnectionClass::FastSeek));
        assert_eq!(allocator.activate_pre_cache(), None);

        allocator.deactivate_seek();
        assert!(!allocator.is_active(ConnectionClass::FastSeek));
        assert_eq!(allocator.activate_pre_cache(), Some(0));

        // Unpaired deactivation does not underflow.
        allocator.deactivate_seek();
        allocator.activate_seek();
        assert!(allocator.is_active(ConnectionClass::FastSeek));
    }

    #[test]
    fn test_transfer_accounting() {
        let allocator = BandwidthAllocator::new();
        allocator.activate_main();
        allocator.record_transfer(ConnectionClass::MainPlayback, 1000);
        allocator.record_transfer(ConnectionClass::PreCache, 500);
        allocator.activate_pre_cache();
        allocator.record_transfer(ConnectionClass::PreCache, 250);

        let snapshot = allocator.snapshot();
        assert_eq!(snapshot.main.bytes_transferred, 1000);
        assert_eq!(snapshot.pre_cache[0].bytes_transferred, 250);
        assert_eq!(snapshot.total_transferred(), 1250);
    }
}

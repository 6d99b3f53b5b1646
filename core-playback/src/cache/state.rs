//! Buffering state machine and health reports.

use core_runtime::events::{CacheEvent, CoreEvent, EventBus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Playback readiness as seen by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferingState {
    /// Nothing requested yet.
    Idle,
    /// Waiting for data before playback can start.
    Buffering,
    /// Enough data for playback to start.
    Ready,
    /// Playback running.
    Playing,
    /// Playback running but the active window is under-filled.
    LowBuffer,
}

impl BufferingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferingState::Idle => "idle",
            BufferingState::Buffering => "buffering",
            BufferingState::Ready => "ready",
            BufferingState::Playing => "playing",
            BufferingState::LowBuffer => "low_buffer",
        }
    }
}

impl fmt::Display for BufferingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a health check at one position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheHealthInfo {
    pub target_chunk: usize,
    pub ready_chunks: usize,
    pub required_chunks: usize,
    pub missing_chunks: usize,
    pub is_ready: bool,
    pub is_buffering: bool,
    /// `ready_chunks / required_chunks`, in `[0, 1]`.
    pub progress: f64,
}

impl CacheHealthInfo {
    pub fn new(target_chunk: usize, ready_chunks: usize, required_chunks: usize) -> Self {
        let is_ready = ready_chunks >= required_chunks;
        let progress = if required_chunks == 0 {
            1.0
        } else {
            (ready_chunks as f64 / required_chunks as f64).min(1.0)
        };
        Self {
            target_chunk,
            ready_chunks,
            required_chunks,
            missing_chunks: required_chunks.saturating_sub(ready_chunks),
            is_ready,
            is_buffering: !is_ready,
            progress,
        }
    }
}

/// Next state given a health verdict.
///
/// `resume` is the state `LowBuffer` returns to once refilled.
fn next_state(current: BufferingState, ready: bool, resume: BufferingState) -> BufferingState {
    use BufferingState::*;
    match (current, ready) {
        (Idle, false) => Buffering,
        (Ready | Playing, false) => LowBuffer,
        (Buffering | LowBuffer, false) => current,
        (Idle | Buffering, true) => Ready,
        (LowBuffer, true) => resume,
        (Ready | Playing, true) => current,
    }
}

struct Transitions {
    resume: BufferingState,
}

/// Owns the buffering state; notifies subscribers only on actual change.
pub struct BufferingStateMachine {
    resource_id: String,
    tx: watch::Sender<BufferingState>,
    transitions: Mutex<Transitions>,
    event_bus: Option<Arc<EventBus>>,
}

impl BufferingStateMachine {
    pub fn new(resource_id: impl Into<String>, event_bus: Option<Arc<EventBus>>) -> Self {
        let (tx, _rx) = watch::channel(BufferingState::Idle);
        Self {
            resource_id: resource_id.into(),
            tx,
            transitions: Mutex::new(Transitions {
                resume: BufferingState::Ready,
            }),
            event_bus,
        }
    }

    pub fn state(&self) -> BufferingState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BufferingState> {
        self.tx.subscribe()
    }

    /// Apply a health verdict.
    pub fn on_health(&self, ready: bool) -> BufferingState {
        let mut transitions = self.transitions.lock();
        let current = self.state();
        if !ready && matches!(current, BufferingState::Ready | BufferingState::Playing) {
            transitions.resume = current;
        }
        let next = next_state(current, ready, transitions.resume);
        self.apply(current, next);
        next
    }

    /// Playback started. While `LowBuffer`, only the resume target changes.
    pub fn mark_playing(&self) {
        let mut transitions = self.transitions.lock();
        let current = self.state();
        transitions.resume = BufferingState::Playing;
        if current != BufferingState::LowBuffer {
            self.apply(current, BufferingState::Playing);
        }
    }

    /// Force a state.
    pub fn set(&self, state: BufferingState) {
        let _transitions = self.transitions.lock();
        let current = self.state();
        self.apply(current, state);
    }

    fn apply(&self, from: BufferingState, to: BufferingState) {
        let changed = self.tx.send_if_modified(|state| {
            if *state == to {
                false
            } else {
                *state = to;
                true
            }
        });
        if !changed {
            return;
        }

        debug!(resource_id = %self.resource_id, from = %from, to = %to, "Buffering state changed");
        if let Some(bus) = &self.event_bus {
            let _ = bus.emit(CoreEvent::Cache(CacheEvent::BufferingStateChanged {
                resource_id: self.resource_id.clone(),
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            }));
        }
    }
}

impl fmt::Debug for BufferingStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferingStateMachine")
            .field("resource_id", &self.resource_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BufferingState::*;

    #[test]
    fn test_startup_path() {
        let machine = BufferingStateMachine::new("r", None);
        assert_eq!(machine.state(), Idle);
        assert_eq!(machine.on_health(false), Buffering);
        assert_eq!(machine.on_health(false), Buffering);
        assert_eq!(machine.on_health(true), Ready);
        machine.mark_playing();
        assert_eq!(machine.state(), Playing);
    }

    #[test]
    fn test_low_buffer_returns_to_playing() {
        let machine = BufferingStateMachine::new("r", None);
        machine.on_health(true);
        machine.mark_playing();

        assert_eq!(machine.on_health(false), LowBuffer);
        assert_eq!(machine.on_health(true), Playing);
    }

    #[test]
    fn test_low_buffer_from_ready_returns_to_ready() {
        let machine = BufferingStateMachine::new("r", None);
        machine.on_health(true);
        assert_eq!(machine.on_health(false), LowBuffer);
        assert_eq!(machine.on_health(true), Ready);
    }

    #[test]
    fn test_playing_during_low_buffer_sets_resume_target() {
        let machine = BufferingStateMachine::new("r", None);
        machine.on_health(true);
        machine.on_health(false);
        machine.mark_playing();
        assert_eq!(machine.state(), LowBuffer);
        assert_eq!(machine.on_health(true), Playing);
    }

    #[tokio::test]
    async fn test_subscribers_see_only_changes() {
        let bus = Arc::new(EventBus::new(16));
        let mut events = bus.subscribe();
        let machine = BufferingStateMachine::new("track-1", Some(Arc::clone(&bus)));
        let mut rx = machine.subscribe();

        machine.set(Buffering);
        machine.set(Buffering);
        machine.set(Ready);

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Ready);
        assert!(!rx.has_changed().unwrap());

        let first = events.recv().await.unwrap();
        assert_eq!(
            first,
            CoreEvent::Cache(CacheEvent::BufferingStateChanged {
                resource_id: "track-1".to_string(),
                from: "idle".to_string(),
                to: "buffering".to_string(),
            })
        );
        let second = events.recv().await.unwrap();
        assert!(matches!(
            second,
            CoreEvent::Cache(CacheEvent::BufferingStateChanged { ref to, .. }) if to == "ready"
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_health_info() {
        let info = CacheHealthInfo::new(3, 2, 3);
        assert!(!info.is_ready);
        assert_eq!(info.missing_chunks, 1);
        assert!((info.progress - 2.0 / 3.0).abs() < 1e-9);
        assert!(CacheHealthInfo::new(9, 1, 1).is_ready);
    }
}

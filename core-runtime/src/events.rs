//! # Event Bus System
//!
//! Provides an event-driven architecture for the streaming cache using `tokio::sync::broadcast`.
//! Cache orchestrators publish typed events; hosts (UI, telemetry, the playback
//! engine) subscribe without holding a reference to the cache itself.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: Strongly-typed enum hierarchies for cache and prefetch activity
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   emit    ┌───────────┐
//! │ StreamCache (A)  ├──────────>│           │   subscribe   ┌────────────┐
//! └──────────────────┘           │ EventBus  ├──────────────>│ Subscriber │
//! ┌──────────────────┐   emit    │ (broadcast│               └────────────┘
//! │ StreamCache (B)  ├──────────>│  channel) │
//! └──────────────────┘           └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CacheEvent, CoreEvent, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut subscriber = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Cache(CacheEvent::BufferingProgress {
//!         resource_id: "track-1".to_string(),
//!         percent: 42,
//!     }))
//!     .ok();
//!
//! let event = subscriber.recv().await.unwrap();
//! assert_eq!(event.description(), "Buffering progress");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal; the subscriber can continue receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.
//!
//! Emitting with no subscribers returns an error that publishers ignore.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// Subscribers that can't keep up will receive `RecvError::Lagged`.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Chunk cache lifecycle and buffering events
    Cache(CacheEvent),
    /// Predictive prefetch events
    Prefetch(PrefetchEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Cache(e) => e.description(),
            CoreEvent::Prefetch(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Cache(CacheEvent::Initialized { ready: false, .. }) => EventSeverity::Error,
            CoreEvent::Cache(CacheEvent::StrategyFallback { .. }) => EventSeverity::Warning,
            CoreEvent::Cache(CacheEvent::BufferingStateChanged { to, .. }) if to == "low_buffer" => {
                EventSeverity::Warning
            }
            CoreEvent::Cache(CacheEvent::StrategyDetermined { .. })
            | CoreEvent::Cache(CacheEvent::Initialized { .. })
            | CoreEvent::Cache(CacheEvent::FullyCached { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }

    /// Resource the event refers to.
    pub fn resource_id(&self) -> &str {
        match self {
            CoreEvent::Cache(e) => e.resource_id(),
            CoreEvent::Prefetch(e) => e.resource_id(),
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

// ============================================================================
// Cache Events
// ============================================================================

/// Events emitted by a stream cache orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum CacheEvent {
    /// Download strategy selected for a resource.
    StrategyDetermined {
        resource_id: String,
        /// `range_requests`, `parallel_full` or `sequential_full`
        strategy: String,
    },
    /// Whole-resource download switched strategy after failures.
    StrategyFallback {
        resource_id: String,
        from: String,
        to: String,
    },
    /// Startup finished.
    Initialized {
        resource_id: String,
        /// Whether the first chunks became readable in time.
        ready: bool,
    },
    /// Buffering state machine changed state.
    BufferingStateChanged {
        resource_id: String,
        from: String,
        to: String,
    },
    /// Share of the resource held in memory changed.
    BufferingProgress {
        resource_id: String,
        /// 0..=100
        percent: u8,
    },
    /// Every chunk of the resource is cached.
    FullyCached {
        resource_id: String,
        total_bytes: u64,
    },
    /// A tail entry was dropped from the cross-resource tail cache.
    TailEvicted {
        resource_id: String,
        memory_bytes: u64,
    },
}

impl CacheEvent {
    fn description(&self) -> &str {
        match self {
            CacheEvent::StrategyDetermined { .. } => "Download strategy determined",
            CacheEvent::StrategyFallback { .. } => "Download strategy fell back",
            CacheEvent::Initialized { .. } => "Stream cache initialized",
            CacheEvent::BufferingStateChanged { .. } => "Buffering state changed",
            CacheEvent::BufferingProgress { .. } => "Buffering progress",
            CacheEvent::FullyCached { .. } => "Resource fully cached",
            CacheEvent::TailEvicted { .. } => "Tail cache entry evicted",
        }
    }

    fn resource_id(&self) -> &str {
        match self {
            CacheEvent::StrategyDetermined { resource_id, .. }
            | CacheEvent::StrategyFallback { resource_id, .. }
            | CacheEvent::Initialized { resource_id, .. }
            | CacheEvent::BufferingStateChanged { resource_id, .. }
            | CacheEvent::BufferingProgress { resource_id, .. }
            | CacheEvent::FullyCached { resource_id, .. }
            | CacheEvent::TailEvicted { resource_id, .. } => resource_id,
        }
    }
}

// ============================================================================
// Prefetch Events
// ============================================================================

/// Events emitted by the predictive prefetcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum PrefetchEvent {
    /// A segment started downloading.
    SegmentStarted {
        resource_id: String,
        /// Segment offset as a percentage of the resource.
        ratio_percent: u8,
        start_chunk: u64,
    },
    /// A segment finished (fully or partially).
    SegmentCompleted {
        resource_id: String,
        ratio_percent: u8,
        chunks: u64,
    },
    /// A segment was stopped before completion.
    SegmentStopped {
        resource_id: String,
        ratio_percent: u8,
    },
}

impl PrefetchEvent {
    fn description(&self) -> &str {
        match self {
            PrefetchEvent::SegmentStarted { .. } => "Prefetch segment started",
            PrefetchEvent::SegmentCompleted { .. } => "Prefetch segment completed",
            PrefetchEvent::SegmentStopped { .. } => "Prefetch segment stopped",
        }
    }

    fn resource_id(&self) -> &str {
        match self {
            PrefetchEvent::SegmentStarted { resource_id, .. }
            | PrefetchEvent::SegmentCompleted { resource_id, .. }
            | PrefetchEvent::SegmentStopped { resource_id, .. } => resource_id,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Uses `tokio::sync::broadcast` internally, which provides:
/// - Multiple producers (clone the `EventBus`)
/// - Multiple consumers (each `subscribe()` creates a new receiver)
/// - Non-blocking sends (events are cloned for each subscriber)
/// - Lagging detection (slow subscribers get `RecvError::Lagged`)
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// When a subscriber falls behind by more than `capacity` events it
    /// receives a `RecvError::Lagged` error.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event.
    /// Returns an error if there are no active subscribers.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber to receive events.
    ///
    /// Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

/// Type alias for event filter functions.
type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with additional filtering capabilities.
///
/// # Example
///
/// ```rust
/// use core_runtime::events::{EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let stream = EventStream::new(event_bus.subscribe())
///     .for_resource("track-1");
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    /// Creates a new event stream from a receiver.
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Adds a filter function to this stream.
    ///
    /// Only events that match the filter will be returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Only pass events about one resource.
    pub fn for_resource(self, resource_id: impl Into<String>) -> Self {
        let resource_id = resource_id.into();
        self.filter(move |event| event.resource_id() == resource_id)
    }

    /// Receives the next event that passes the filter (if any).
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;

            let Some(filter) = &self.filter else {
                return Ok(event);
            };

            if filter(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    let Some(filter) = &self.filter else {
                        return Some(Ok(event));
                    };

                    if filter(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

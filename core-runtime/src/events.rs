//! # Player Event Stream
//!
//! Typed events emitted by a playback session to its downstream consumer,
//! and the [`EventSink`] that delivers them.
//!
//! ## Delivery contract
//!
//! The consumer is a *single logical subscriber*. The sink therefore does not
//! broadcast: it queues. Events emitted while no consumer is attached are
//! held in order and flushed the moment one attaches; events emitted after
//! the sink is closed are dropped. Within one sink, delivery order always
//! equals emission order.
//!
//! ```rust
//! use core_runtime::events::{EventSink, PlayerEvent};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let sink = EventSink::new();
//! sink.emit(PlayerEvent::BufferingStart);
//!
//! // Late attach still observes the queued event.
//! let mut rx = sink.attach();
//! assert_eq!(rx.recv().await, Some(PlayerEvent::BufferingStart));
//! # }
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::mpsc;

/// Receiver half handed to the attached consumer.
pub type EventReceiver = mpsc::UnboundedReceiver<PlayerEvent>;

// ============================================================================
// Event Types
// ============================================================================

/// Events a playback session reports to its host.
///
/// The serialized form is a tagged map (`{"event": "bufferingStart", ...}`),
/// the shape host-side event channels expect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum PlayerEvent {
    /// The engine reached a ready state for the first time.
    ///
    /// Dimensions are upright display dimensions: sources recorded in
    /// portrait (rotation 90°/270°) report swapped width/height.
    #[serde(rename_all = "camelCase")]
    Initialized {
        /// Media duration in milliseconds.
        duration_ms: u64,
        /// Display width in pixels, if the source carries video.
        width: Option<u32>,
        /// Display height in pixels, if the source carries video.
        height: Option<u32>,
    },
    /// The engine entered a buffering phase.
    BufferingStart,
    /// The engine left the buffering phase.
    BufferingEnd,
    /// Progress snapshot of buffered media.
    #[serde(rename_all = "camelCase")]
    BufferingUpdate {
        /// Buffered ranges as `[start_ms, end_ms]` pairs.
        buffered_ranges: Vec<[u64; 2]>,
    },
    /// Playback reached the end of the media.
    Completed,
    /// Terminal failure, classified by `code`.
    #[serde(rename_all = "camelCase")]
    Error {
        /// `"403"` for authorization failures, `"VideoError"` for generic
        /// engine failures, or a transport-specific code from the cache layer.
        code: String,
        /// Human-readable description.
        message: String,
    },
}

impl PlayerEvent {
    /// Returns `true` for terminal error events.
    pub fn is_error(&self) -> bool {
        matches!(self, PlayerEvent::Error { .. })
    }

    /// A human-readable description of the event kind.
    pub fn description(&self) -> &str {
        match self {
            PlayerEvent::Initialized { .. } => "Playback initialized",
            PlayerEvent::BufferingStart => "Buffering started",
            PlayerEvent::BufferingEnd => "Buffering ended",
            PlayerEvent::BufferingUpdate { .. } => "Buffered ranges updated",
            PlayerEvent::Completed => "Playback completed",
            PlayerEvent::Error { .. } => "Playback error",
        }
    }
}

// ============================================================================
// Event Sink
// ============================================================================

#[derive(Default)]
struct SinkState {
    pending: VecDeque<PlayerEvent>,
    delegate: Option<mpsc::UnboundedSender<PlayerEvent>>,
    closed: bool,
}

/// Single-consumer event sink with queue-while-detached semantics.
///
/// Cloning is cheap and shares the underlying queue, so producers on other
/// tasks can emit through their own handle.
#[derive(Clone, Default)]
pub struct EventSink {
    state: std::sync::Arc<Mutex<SinkState>>,
}

impl EventSink {
    /// Create a detached sink. Events queue until [`EventSink::attach`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit an event toward the consumer.
    ///
    /// Queued if no consumer is attached; silently dropped once the sink is
    /// closed. If the attached receiver was dropped without a detach, the
    /// sink reverts to queuing so the event is not lost.
    pub fn emit(&self, event: PlayerEvent) {
        let mut state = self.state.lock();
        if state.closed {
            tracing::trace!(event = event.description(), "Dropping event after close");
            return;
        }
        if let Some(delegate) = &state.delegate {
            match delegate.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => {
                    state.delegate = None;
                    state.pending.push_back(event);
                }
            }
        } else {
            state.pending.push_back(event);
        }
    }

    /// Attach the consumer, flushing everything queued so far in order.
    ///
    /// Attaching replaces any previous consumer; events already delivered to
    /// it are not replayed.
    pub fn attach(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        for event in state.pending.drain(..) {
            // Receiver cannot be dropped yet, so the send cannot fail.
            let _ = tx.send(event);
        }
        state.delegate = Some(tx);
        rx
    }

    /// Detach the consumer. Later events queue again.
    pub fn detach(&self) {
        self.state.lock().delegate = None;
    }

    /// Close the sink: undelivered queued events are discarded and every
    /// event emitted from now on is dropped. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.delegate = None;
        state.pending.clear();
    }

    /// Whether [`EventSink::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of events currently queued for a future consumer.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventSink")
            .field("pending", &state.pending.len())
            .field("attached", &state.delegate.is_some())
            .field("closed", &state.closed)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

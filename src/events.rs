//! Observer layer: everything the core tells the outside world.
//!
//! Events travel over a `tokio::sync::broadcast` channel. The core emits
//! without knowing who listens; each subscriber receives independently,
//! and a subscriber that falls behind loses the oldest events without
//! slowing the hot path. Every error raises its event before the waiting
//! future observes the failure.
//!
//! # Usage
//!
//! ```ignore
//! let mut events = client.subscribe();
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         FepEvent::Unsolicited { message } => store.record(message),
//!         FepEvent::StateChanged { old, new } => log::info!("{old} -> {new}"),
//!         _ => {}
//!     }
//! }
//! ```

use tokio::sync::broadcast;

use crate::client::ClientState;
use crate::error::ChannelSide;
use crate::iso::{Message, Mti};

/// Buffered events per subscriber before the oldest are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the client core.
#[derive(Debug, Clone)]
pub enum FepEvent {
    /// A socket finished connecting.
    Connected {
        /// Which socket.
        side: ChannelSide,
    },

    /// A socket went down.
    Disconnected {
        /// Which socket.
        side: ChannelSide,
        /// Human-readable cause (peer close, write error, read idle).
        cause: String,
    },

    /// Sign-on was accepted with response code "00".
    SignedOn,

    /// Sign-off was accepted.
    SignedOff,

    /// The aggregate state changed.
    StateChanged {
        /// Previous state.
        old: ClientState,
        /// New state.
        new: ClientState,
    },

    /// A reconnect attempt is starting for a failed side.
    Reconnecting {
        /// Which socket.
        side: ChannelSide,
        /// 1-based attempt number.
        attempt: u32,
    },

    /// An application message arrived and matched a pending request.
    MessageReceived {
        /// Its MTI.
        mti: Mti,
        /// Its STAN, when present.
        stan: Option<String>,
    },

    /// An inbound message matched no pending STAN: a late response or a
    /// server-initiated notification. Delivered exactly once per message.
    Unsolicited {
        /// The full message.
        message: Message,
    },

    /// Inbound bytes failed to frame or parse.
    DecodeError {
        /// Which socket.
        side: ChannelSide,
        /// What went wrong.
        detail: String,
    },

    /// A transport-level error outside the decode path: connect failure
    /// during reconnect, reconnect exhaustion, write failure.
    TransportError {
        /// Which socket.
        side: ChannelSide,
        /// What went wrong.
        detail: String,
    },
}

/// Broadcast hub for [`FepEvent`]s. Cheap to clone; all clones feed the
/// same subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FepEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default per-subscriber buffer.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<FepEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. A bus with no subscribers swallows it.
    pub fn emit(&self, event: FepEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(FepEvent::SignedOn);

        assert!(matches!(a.recv().await.unwrap(), FepEvent::SignedOn));
        assert!(matches!(b.recv().await.unwrap(), FepEvent::SignedOn));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(FepEvent::SignedOff);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.emit(FepEvent::SignedOn);
        let mut rx = bus.subscribe();
        bus.emit(FepEvent::SignedOff);
        assert!(matches!(rx.recv().await.unwrap(), FepEvent::SignedOff));
    }
}

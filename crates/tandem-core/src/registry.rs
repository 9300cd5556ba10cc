//! Connection registry.
//!
//! The registry maps connection identifiers to live outbound channels. The
//! pairing engine only needs two things from it: "is this connection still
//! reachable" and "deliver this frame", captured by [`ConnectionRegistry`].

use dashmap::DashMap;
use std::fmt;
use tandem_protocol::ServerFrame;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build a connection ID from a fixed value (useful in tests).
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Get the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ConnectionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Outbound half of a connection: frames pushed here are written to the socket.
pub type Outbox = mpsc::UnboundedSender<ServerFrame>;

/// Receiving half handed to the connection's writer.
pub type Inbox = mpsc::UnboundedReceiver<ServerFrame>;

/// Lookup and delivery seam used by the pairing engine and router.
///
/// Implementations must not call back into the engine.
pub trait ConnectionRegistry: Send + Sync {
    /// Whether the connection exists and can still receive frames.
    fn is_reachable(&self, id: &ConnectionId) -> bool;

    /// Push a frame to a connection.
    ///
    /// Returns `false` if the connection is gone; the frame is dropped.
    fn deliver(&self, id: &ConnectionId, frame: ServerFrame) -> bool;

    /// Number of live connections.
    fn live_count(&self) -> usize;
}

/// In-memory registry of connection outboxes.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    outboxes: DashMap<ConnectionId, Outbox>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return the receiver for its outbound frames.
    ///
    /// Registering an id that is already present replaces its outbox; the
    /// previous receiver then observes a closed channel.
    pub fn register(&self, id: ConnectionId) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outboxes.insert(id, tx);
        debug!(connection = %id, live = self.outboxes.len(), "Connection registered");
        rx
    }

    /// Remove a connection.
    ///
    /// Returns `true` if the connection was registered.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let removed = self.outboxes.remove(id).is_some();
        if removed {
            debug!(connection = %id, live = self.outboxes.len(), "Connection unregistered");
        }
        removed
    }

    /// Push a frame to every live connection.
    ///
    /// Returns the number of connections the frame was delivered to.
    pub fn broadcast(&self, frame: &ServerFrame) -> usize {
        let delivered = self
            .outboxes
            .iter()
            .filter(|entry| entry.value().send(frame.clone()).is_ok())
            .count();
        trace!(kind = frame.kind(), recipients = delivered, "Broadcast frame");
        delivered
    }

    /// Push the current live count to every connection.
    pub fn broadcast_online_count(&self) -> usize {
        let count = self.live_count() as u64;
        self.broadcast(&ServerFrame::Online { count })
    }
}

impl ConnectionRegistry for ChannelRegistry {
    fn is_reachable(&self, id: &ConnectionId) -> bool {
        self.outboxes
            .get(id)
            .map(|outbox| !outbox.is_closed())
            .unwrap_or(false)
    }

    fn deliver(&self, id: &ConnectionId, frame: ServerFrame) -> bool {
        match self.outboxes.get(id) {
            Some(outbox) => {
                trace!(connection = %id, kind = frame.kind(), "Delivering frame");
                outbox.send(frame).is_ok()
            }
            None => false,
        }
    }

    fn live_count(&self) -> usize {
        self.outboxes.len()
    }
}

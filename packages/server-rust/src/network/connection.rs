//! Client handles and the live-connection registry.
//!
//! A handle is the opaque token the rest of the system knows a client
//! by: its registry-assigned id plus the sender end of a bounded
//! outbound channel. The receiver end is drained by the connection's
//! socket write loop. Handle equality is by id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;

/// Outbound channel capacity per connection. A client that stops reading
/// fills its channel; events to it are then dropped and the handle is
/// purged rather than stalling the writer.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Unique identifier for a connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

/// One frame headed for a connection's socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A serialized frame, written followed by the frame delimiter.
    Line(String),
    /// Ask the write loop to close the socket.
    Close,
}

/// Error returned when moving a frame onto a connection's channel fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The channel is full; the client is not keeping up.
    Full,
    /// The write loop has exited; the connection is gone.
    Disconnected,
    /// The channel stayed full for the whole timeout.
    Timeout,
}

/// Handle to a single live connection.
#[derive(Debug)]
pub struct ClientHandle {
    /// Registry-assigned connection id.
    pub id: ClientId,
    /// Sender end of the bounded outbound frame channel.
    tx: mpsc::Sender<OutboundFrame>,
    /// When this connection was accepted.
    pub connected_at: Instant,
}

impl ClientHandle {
    /// Attempt to enqueue a frame without blocking.
    ///
    /// # Errors
    ///
    /// [`SendError::Full`] if the channel is full,
    /// [`SendError::Disconnected`] if the write loop has exited.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
        })
    }

    /// Enqueue a frame, waiting up to `timeout` for channel space.
    ///
    /// # Errors
    ///
    /// [`SendError::Timeout`] if the channel stayed full,
    /// [`SendError::Disconnected`] if the write loop has exited.
    pub async fn send_timeout(
        &self,
        frame: OutboundFrame,
        timeout: Duration,
    ) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Whether the write loop still holds the receiver.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Thread-safe registry of all active connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ClientId, Arc<ClientHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates an empty registry. Ids start at 1; 0 is never assigned.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new connection, returning its handle and the receiver
    /// for the socket write loop.
    pub fn register(
        &self,
        capacity: usize,
    ) -> (Arc<ClientHandle>, mpsc::Receiver<OutboundFrame>) {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Arc::new(ClientHandle {
            id,
            tx,
            connected_at: Instant::now(),
        });
        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    /// Remove a connection, returning its handle if it was registered.
    pub fn remove(&self, id: ClientId) -> Option<Arc<ClientHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    /// Look up a connection by id.
    #[must_use]
    pub fn get(&self, id: ClientId) -> Option<Arc<ClientHandle>> {
        self.connections.get(&id).map(|r| Arc::clone(r.value()))
    }

    /// Number of active connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Remove and return every connection. Used during shutdown to send
    /// each write loop its close frame.
    pub fn drain_all(&self) -> Vec<Arc<ClientHandle>> {
        let ids: Vec<ClientId> = self.connections.iter().map(|entry| *entry.key()).collect();
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, handle)) = self.connections.remove(&id) {
                handles.push(handle);
            }
        }
        handles
    }
}

// =============================================================================
// Client Handle — outbound side of one subscriber connection
// =============================================================================
//
// The socket itself is owned by the WebSocket task in `api::ws`; everything
// else talks to it through this bounded queue. When that task ends the
// receiver is dropped, which is how the rest of the server observes that a
// client has gone away.
// =============================================================================

use std::fmt;

use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a queued message did not reach a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The client's socket task has finished.
    Closed,
    /// The client is not draining its queue fast enough.
    Lagging,
}

#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<String>,
}

impl ClientHandle {
    /// Create a handle plus the receiver the socket task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: ConnectionId::new(),
                outbound,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Queue a message, waiting for room. Used for the one-off backfill.
    pub async fn send(&self, text: String) -> Result<(), DeliveryError> {
        self.outbound.send(text).await.map_err(|_| DeliveryError::Closed)
    }

    /// Queue a message without waiting. Used on the live tick path so one
    /// slow client never holds up the rest of its group.
    pub fn try_send(&self, text: String) -> Result<(), DeliveryError> {
        self.outbound.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Lagging,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

//! Master-side bookkeeping for a single authenticated link.

use std::fmt;
use std::net::SocketAddr;

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Opaque per-connection identifier, unique for the lifetime of the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Handle the master keeps for each authenticated worker link: its advertised labels
/// and a channel to the task that owns the write half of its socket.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub labels: Vec<String>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, addr: SocketAddr, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self { id, addr, labels: Vec::new(), outbound }
    }

    /// Queue a frame for this connection's writer task. Returns `false` if the writer
    /// task has already exited (the connection is effectively gone, even if the close
    /// notification hasn't been processed yet).
    pub(crate) fn send(&self, message: Message) -> bool {
        self.outbound.send(message).is_ok()
    }
}

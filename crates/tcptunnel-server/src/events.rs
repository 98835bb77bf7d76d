//! Server-side notifications
//!
//! State lives in the components; events only report transitions so an
//! embedding process can log or count them.

use std::net::SocketAddr;

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The public peer closed before any relay claimed the session
    PublicClosed,
    /// The client reported it could not reach its local target
    LocalUnreachable,
    /// Removed explicitly, or purged with its owning client
    Removed,
    /// A joined pipe finished
    PipeClosed { sent: u64, received: u64 },
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    ConnectionAccepted {
        id: Uuid,
        peer_addr: SocketAddr,
    },
    ClientConnected {
        name: String,
        peer_addr: SocketAddr,
    },
    ClientRejected {
        peer_addr: SocketAddr,
        reason: String,
    },
    /// A newer connection took over `name`
    ClientEvicted {
        name: String,
        peer_addr: SocketAddr,
    },
    ClientDisconnected {
        name: String,
        purged_sessions: usize,
    },
    ConnectionClosed {
        id: Uuid,
        peer_addr: SocketAddr,
    },
    ClientMessage {
        name: String,
        message: String,
    },
    UnknownMethod {
        name: String,
        method: Option<String>,
    },
    PortConnection {
        port: u16,
        peer_addr: SocketAddr,
        client: String,
    },
    NoClientOnline {
        port: u16,
        peer_addr: SocketAddr,
    },
    PortError {
        port: u16,
        error: String,
    },
    PortClosed {
        port: u16,
    },
    SessionCreated {
        session: String,
        client: String,
        public_port: u16,
    },
    SessionPiped {
        session: String,
    },
    SessionClosed {
        session: String,
        reason: SessionEnd,
    },
    RelayRejected {
        peer_addr: SocketAddr,
        reason: String,
    },
}

/// Optional event channel shared by the server components
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<UnboundedSender<ServerEvent>>);

impl EventSink {
    pub fn new(tx: UnboundedSender<ServerEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn emit(&self, event: ServerEvent) {
        if let Some(tx) = &self.0 {
            // A dropped receiver only means nobody is listening
            let _ = tx.send(event);
        }
    }
}

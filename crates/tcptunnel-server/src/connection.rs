//! Per-connection bookkeeping for the control server

use std::net::SocketAddr;

use tcptunnel_proto::ControlMessage;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Opaque identity of one accepted control connection
pub type ConnectionId = Uuid;

/// Handshake state of a control connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Unverified,
    Verified { name: String, secret: String },
    /// Lost its name to a newer connection and is being closed
    Evicted { name: String, secret: String },
}

impl ConnectionState {
    pub(crate) fn secret(&self) -> Option<&str> {
        match self {
            ConnectionState::Unverified => None,
            ConnectionState::Verified { secret, .. } | ConnectionState::Evicted { secret, .. } => {
                Some(secret)
            }
        }
    }
}

/// Work queued for a connection's task by other parts of the server
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Sign with the connection's secret and send
    Message(ControlMessage),
    /// Flush and close the connection
    Close,
}

pub(crate) struct ConnectionHandle {
    pub(crate) peer_addr: SocketAddr,
    pub(crate) state: ConnectionState,
    pub(crate) outbound: UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub(crate) fn new(peer_addr: SocketAddr, outbound: UnboundedSender<Outbound>) -> Self {
        Self {
            peer_addr,
            state: ConnectionState::Unverified,
            outbound,
        }
    }

    pub(crate) fn send(&self, msg: ControlMessage) -> bool {
        self.outbound.send(Outbound::Message(msg)).is_ok()
    }

    pub(crate) fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// Everything needed to hand a forwarded connection to its client
pub(crate) struct ClientTarget {
    pub(crate) client_name: String,
    pub(crate) secret: String,
    pub(crate) client_port: u16,
    pub(crate) outbound: UnboundedSender<Outbound>,
}

use std::net::SocketAddr;

use crate::client::PingInfo;
use crate::proxy::LegOutcome;

/// Client-side notifications
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { server: SocketAddr },
    /// First server message verified under the shared secret
    Verified,
    ServerMessage { message: String },
    Heartbeat(PingInfo),
    SessionStarted {
        session: String,
        local_port: u16,
    },
    SessionClosed {
        session: String,
        outcome: LegOutcome,
    },
    UnknownMethod { method: Option<String> },
}

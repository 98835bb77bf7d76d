use tcptunnel_proto::ProtoError;
use thiserror::Error;

/// Tunnel server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ServerError {
    pub(crate) fn bind(addr: std::net::SocketAddr, e: std::io::Error) -> Self {
        ServerError::BindError {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: e.to_string(),
        }
    }
}

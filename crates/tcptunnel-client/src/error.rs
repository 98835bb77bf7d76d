use tcptunnel_proto::ProtoError;
use thiserror::Error;

/// Tunnel client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("Failed to connect to tunnel server at {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

//! Control and relay message types

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtoError;
use crate::signing::sign;

/// A decoded message as a flat JSON object
pub type Fields = serde_json::Map<String, Value>;

/// Acknowledgement text sent once a client handshake verifies
pub const CONNECTED_GREETING: &str = "connected! good job";

/// Messages carried on the persistent control channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client handshake
    Verify { name: String },
    /// Free-form informational text, in either direction
    Message { message: String },
    /// Another connection took over this client's name
    Conflict,
    /// Handshake signature did not verify
    Rejected,
    /// Server asks the client to proxy one forwarded connection
    NewSession {
        session: String,
        /// Client-side target port
        #[serde(rename = "localPort")]
        local_port: u16,
        /// Server relay listener port
        #[serde(rename = "remotePort")]
        remote_port: u16,
    },
    /// Client could not reach its local target for a session
    CloseSession { session: String, message: String },
    /// Heartbeat request
    Ping { sent_at: i64 },
    /// Heartbeat reply, echoing the request timestamp
    Pong { sent_at: i64 },
}

impl ControlMessage {
    pub fn method(&self) -> &'static str {
        match self {
            ControlMessage::Verify { .. } => "verify",
            ControlMessage::Message { .. } => "message",
            ControlMessage::Conflict => "conflict",
            ControlMessage::Rejected => "rejected",
            ControlMessage::NewSession { .. } => "new_session",
            ControlMessage::CloseSession { .. } => "close_session",
            ControlMessage::Ping { .. } => "ping",
            ControlMessage::Pong { .. } => "pong",
        }
    }
}

/// First message a client sends on a freshly connected relay socket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Local target reached, join the sockets
    Connected { session: String },
    /// Local target lost, discard the parked connection
    Failed { session: String },
}

/// Serialize `msg` into a flat object, sign it and encode it as JSON bytes
pub fn encode_signed<M: Serialize>(secret: &str, msg: &M) -> Result<Vec<u8>, ProtoError> {
    let mut fields = match serde_json::to_value(msg)? {
        Value::Object(map) => map,
        _ => return Err(ProtoError::NotAnObject),
    };
    sign(secret, &mut fields);
    Ok(serde_json::to_vec(&fields)?)
}

/// Parse a frame payload into a flat JSON object
pub fn decode_fields(payload: &[u8]) -> Result<Fields, ProtoError> {
    match serde_json::from_slice::<Value>(payload)? {
        Value::Object(map) => Ok(map),
        _ => Err(ProtoError::NotAnObject),
    }
}

/// The `method` field, if present and a string
pub fn method_of(fields: &Fields) -> Option<&str> {
    fields.get("method").and_then(Value::as_str)
}

/// Interpret already-verified fields as a typed message
///
/// Signature fields and any extra fields are ignored.
pub fn parse_fields<M: DeserializeOwned>(fields: &Fields) -> Result<M, ProtoError> {
    Ok(serde_json::from_value(Value::Object(fields.clone()))?)
}

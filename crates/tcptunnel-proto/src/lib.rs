//! TCP tunnel protocol definitions
//!
//! This crate defines the wire format shared by the tunnel server and client:
//! signed JSON messages, length-prefixed framing and the raw two-way pipe used
//! once a session is joined.

pub mod codec;
pub mod error;
pub mod messages;
pub mod pipe;
pub mod session;
pub mod signing;

pub use codec::{read_frame, write_frame, ControlChannel, MAX_FRAME_SIZE};
pub use error::ProtoError;
pub use messages::{
    decode_fields, encode_signed, method_of, parse_fields, ControlMessage, Fields, RelayMessage,
    CONNECTED_GREETING,
};
pub use pipe::{pipe_two_way, PipeSide, PipeSummary};
pub use session::{generate_session_id, now_millis, random_string};
pub use signing::{sign, sign_fields, verify, verify_at, VerifyOutcome, DEFAULT_TOLERANCE_MS};

/// Protocol version tag injected into every signed message
pub const PROTOCOL_VERSION: &str = "1.0";

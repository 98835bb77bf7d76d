//! Tunnel server
//!
//! Accepts authenticated control connections from named clients, listens on
//! the configured public ports and relays every accepted public connection to
//! the owning client through a per-connection relay socket.
//!
//! - [`PortManager`] owns the public listeners
//! - [`SessionAgent`] owns the relay listener and the pending/active session index
//! - [`ControlServer`] owns the credential table, the port rules and the
//!   name → connection table, and drives the other two

pub mod agent;
pub mod config;
mod connection;
pub mod control;
pub mod error;
pub mod events;
pub mod ports;

pub use agent::SessionAgent;
pub use config::{PortRule, ServerConfig};
pub use control::{ConnectionId, ControlServer};
pub use error::ServerError;
pub use events::{EventSink, ServerEvent, SessionEnd};
pub use ports::{PortEvent, PortManager};

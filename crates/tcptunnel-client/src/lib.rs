//! Tunnel client library
//!
//! Holds one outbound control connection to the tunnel server and, for every
//! `new_session` directive, joins a fresh local-service socket to a fresh
//! relay socket.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod proxy;
pub mod reconnect;

pub use client::{ClientExit, ClientHandle, ControlClient, PingInfo};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use error::ClientError;
pub use events::ClientEvent;
pub use proxy::{LegOutcome, ProxyLeg};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager, Supervisor, SupervisorExit};

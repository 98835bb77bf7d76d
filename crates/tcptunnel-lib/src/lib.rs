//! TCP tunnel library - public API for Rust applications
//!
//! Re-exports the server and client crates so an application can embed
//! either side of the tunnel.
//!
//! # Quick Start - Tunnel Server
//!
//! ```ignore
//! use std::sync::Arc;
//! use tcptunnel_lib::{ControlServer, PortRule, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = ServerConfig {
//!         listen_addr: "0.0.0.0:10000".parse()?,
//!         port_rules: vec![PortRule::new(5001, "A", 3000)],
//!         ..Default::default()
//!     };
//!     config.clients.insert("A".to_string(), "secret".to_string());
//!
//!     let server = Arc::new(ControlServer::bind(config).await?);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Quick Start - Tunnel Client
//!
//! ```ignore
//! use tcptunnel_lib::{ClientConfig, ReconnectConfig, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::builder()
//!         .server("tunnel.example.com", 10000)
//!         .name("A")
//!         .secret("secret")
//!         .build()?;
//!
//!     let exit = Supervisor::new(config, ReconnectConfig::default()).run().await;
//!     println!("client stopped: {:?}", exit);
//!     Ok(())
//! }
//! ```

// Re-export protocol types
pub use tcptunnel_proto::{
    generate_session_id, sign, verify, ControlMessage, RelayMessage, VerifyOutcome,
};

// Re-export server types
pub use tcptunnel_server::{
    ControlServer, PortEvent, PortManager, PortRule, ServerConfig, ServerError, ServerEvent,
    SessionAgent, SessionEnd,
};

// Re-export client types
pub use tcptunnel_client::{
    ClientConfig, ClientConfigBuilder, ClientError, ClientEvent, ClientExit, ClientHandle,
    ControlClient, LegOutcome, PingInfo, ProxyLeg, ReconnectConfig, ReconnectManager, Supervisor,
    SupervisorExit,
};

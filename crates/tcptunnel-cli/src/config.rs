//! YAML configuration files for the server and client commands
//!
//! Server:
//!
//! ```yaml
//! listen_host: 0.0.0.0
//! listen_port: 10000
//! relay_host: 0.0.0.0   # optional, defaults to listen_host
//! clients:
//!   office: s3cret
//! rules:
//!   - port: 5001
//!     client: office
//!     client_port: 3000
//! ```
//!
//! Client:
//!
//! ```yaml
//! server: tunnel.example.com
//! server_port: 10000
//! name: office
//! secret: s3cret
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tcptunnel_client::ClientConfig;
use tcptunnel_server::{PortRule, ServerConfig};

/// Server configuration file format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFile {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    pub listen_port: u16,

    /// Relay listener host; defaults to `listen_host`
    pub relay_host: Option<String>,

    /// Relay listener port; 0 lets the OS choose
    #[serde(default)]
    pub relay_port: u16,

    /// Interface forwarded ports bind on; defaults to `listen_host`
    pub public_host: Option<String>,

    /// Client name → shared secret
    #[serde(default)]
    pub clients: BTreeMap<String, String>,

    #[serde(default)]
    pub rules: Vec<RuleEntry>,
}

/// One forwarding rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEntry {
    /// Public port on the server
    pub port: u16,
    /// Client that serves it
    pub client: String,
    /// Port on the client's local host
    pub client_port: u16,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn parse_host(field: &str, host: &str) -> Result<IpAddr> {
    host.parse()
        .with_context(|| format!("{} '{}' is not an IP address", field, host))
}

impl ServerFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read server config {}", path.display()))?;
        let file: ServerFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse server config {}", path.display()))?;
        file.validate()
            .with_context(|| format!("Invalid server config {}", path.display()))?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_port == 0 {
            bail!("listen_port cannot be 0");
        }
        for (name, secret) in &self.clients {
            if secret.is_empty() {
                bail!("client '{}' has an empty secret", name);
            }
        }

        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.port == 0 || rule.client_port == 0 {
                bail!("rule for client '{}' uses port 0", rule.client);
            }
            if !seen.insert(rule.port) {
                bail!("port {} appears in more than one rule", rule.port);
            }
            if !self.clients.contains_key(&rule.client) {
                bail!(
                    "rule for port {} names unknown client '{}'",
                    rule.port,
                    rule.client
                );
            }
        }
        Ok(())
    }

    pub fn credentials(&self) -> HashMap<String, String> {
        self.clients
            .iter()
            .map(|(name, secret)| (name.clone(), secret.clone()))
            .collect()
    }

    pub fn port_rules(&self) -> Vec<PortRule> {
        self.rules
            .iter()
            .map(|rule| PortRule::new(rule.port, rule.client.clone(), rule.client_port))
            .collect()
    }

    pub fn to_server_config(&self) -> Result<ServerConfig> {
        let listen_host = parse_host("listen_host", &self.listen_host)?;
        let relay_host = match &self.relay_host {
            Some(host) => parse_host("relay_host", host)?,
            None => listen_host,
        };
        let public_host = match &self.public_host {
            Some(host) => parse_host("public_host", host)?,
            None => listen_host,
        };

        Ok(ServerConfig {
            listen_addr: SocketAddr::new(listen_host, self.listen_port),
            public_host,
            relay_addr: SocketAddr::new(relay_host, self.relay_port),
            clients: self.credentials(),
            port_rules: self.port_rules(),
        })
    }
}

/// Client configuration file format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFile {
    /// Tunnel server host
    pub server: String,

    #[serde(default = "default_server_port")]
    pub server_port: u16,

    pub name: String,

    pub secret: String,

    #[serde(default = "default_interval_ms")]
    pub heartbeat_ms: u64,

    #[serde(default = "default_interval_ms")]
    pub verify_timeout_ms: u64,

    #[serde(default = "default_local_host")]
    pub local_host: String,
}

fn default_server_port() -> u16 {
    10000
}

fn default_interval_ms() -> u64 {
    10_000
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

impl ClientFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read client config {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse client config {}", path.display()))
    }

    pub fn to_client_config(&self) -> Result<ClientConfig> {
        let config = ClientConfig::builder()
            .server(self.server.clone(), self.server_port)
            .name(self.name.clone())
            .secret(self.secret.clone())
            .local_host(self.local_host.clone())
            .heartbeat_interval(Duration::from_millis(self.heartbeat_ms))
            .verify_timeout(Duration::from_millis(self.verify_timeout_ms))
            .build()?;
        Ok(config)
    }
}

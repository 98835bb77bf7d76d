//! Server configuration

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Forward public `public_port` to `client_port` on the client named `client_name`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRule {
    pub public_port: u16,
    pub client_name: String,
    pub client_port: u16,
}

impl PortRule {
    pub fn new(public_port: u16, client_name: impl Into<String>, client_port: u16) -> Self {
        Self {
            public_port,
            client_name: client_name.into(),
            client_port,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Control listener address
    pub listen_addr: SocketAddr,
    /// Interface the forwarded public ports bind on
    pub public_host: IpAddr,
    /// Relay listener address; port 0 lets the OS choose
    pub relay_addr: SocketAddr,
    /// Client name → shared secret
    pub clients: HashMap<String, String>,
    pub port_rules: Vec<PortRule>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 10000),
            public_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            relay_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            clients: HashMap::new(),
            port_rules: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ServerError> {
        for (name, secret) in &self.clients {
            if name.is_empty() {
                return Err(ServerError::InvalidConfig(
                    "client name cannot be empty".to_string(),
                ));
            }
            if secret.is_empty() {
                return Err(ServerError::InvalidConfig(format!(
                    "client '{}' has an empty secret",
                    name
                )));
            }
        }
        rule_table(&self.port_rules).map(|_| ())
    }
}

/// Index rules by public port, rejecting zero and duplicate ports
pub(crate) fn rule_table(rules: &[PortRule]) -> Result<HashMap<u16, PortRule>, ServerError> {
    let mut table = HashMap::with_capacity(rules.len());
    for rule in rules {
        if rule.public_port == 0 || rule.client_port == 0 {
            return Err(ServerError::InvalidConfig(format!(
                "rule for client '{}' uses port 0",
                rule.client_name
            )));
        }
        if table.insert(rule.public_port, rule.clone()).is_some() {
            return Err(ServerError::InvalidConfig(format!(
                "public port {} is forwarded more than once",
                rule.public_port
            )));
        }
    }
    Ok(table)
}

pub(crate) fn public_ports(table: &HashMap<u16, PortRule>) -> BTreeSet<u16> {
    table.keys().copied().collect()
}

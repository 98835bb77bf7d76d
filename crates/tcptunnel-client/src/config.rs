//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    /// Client name announced in the handshake
    pub name: String,
    /// Shared secret registered for `name` on the server
    pub secret: String,
    /// Host the proxied local services listen on
    pub local_host: String,
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
    /// How long the server may take to acknowledge the handshake
    #[serde(with = "duration_millis")]
    pub verify_timeout: Duration,
}

/// Helper module for serializing Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: String::new(),
            server_port: 10000,
            name: String::new(),
            secret: String::new(),
            local_host: "127.0.0.1".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            verify_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// `host:port` of the control listener
    pub fn server_addr(&self) -> String {
        join_host_port(&self.server_host, self.server_port)
    }

    /// Reject settings the client cannot run with
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.server_host.is_empty() {
            return Err(ClientError::InvalidConfig(
                "server host is required".to_string(),
            ));
        }
        if self.server_port == 0 {
            return Err(ClientError::InvalidConfig(
                "server port cannot be 0".to_string(),
            ));
        }
        if self.name.is_empty() {
            return Err(ClientError::InvalidConfig("name is required".to_string()));
        }
        if self.secret.is_empty() {
            return Err(ClientError::InvalidConfig("secret is required".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ClientError::InvalidConfig(
                "heartbeat interval cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// `host:port`, bracketing IPv6 literals
pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.server_host = host.into();
        self.config.server_port = port;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.config.secret = secret.into();
        self
    }

    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.config.local_host = host.into();
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn verify_timeout(mut self, timeout: Duration) -> Self {
        self.config.verify_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ClientConfig, ClientError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

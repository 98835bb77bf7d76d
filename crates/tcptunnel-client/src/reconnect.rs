//! Reconnection policy and the supervisor that applies it

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ClientExit, ControlClient};
use crate::config::ClientConfig;
use crate::events::ClientEvent;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<usize>,
    /// Stop instead of retrying when no connection has ever been verified
    pub give_up_if_never_connected: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(5),
            multiplier: 1.0,
            max_attempts: None,
            give_up_if_never_connected: true,
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,
}

/// Backoff bookkeeping between reconnection attempts
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Wait before next reconnection attempt
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        debug!(
            "Waiting {:?} before reconnection attempt {}",
            self.current_backoff, self.attempt
        );

        sleep(self.current_backoff).await;

        let next_backoff =
            Duration::from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier);
        self.current_backoff = next_backoff.min(self.config.max_backoff);

        Ok(())
    }

    /// Reset backoff (call after a verified connection)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}

/// Terminal result of a supervised client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    VerifyFailed,
    Conflict,
    /// The first connection never got verified and retrying is disabled
    NeverConnected { error: String },
    /// `max_attempts` reconnections in a row failed
    GaveUp { attempts: usize },
    Shutdown,
}

/// Keeps a [`ControlClient`] connected, reconnecting after transport failures
pub struct Supervisor {
    config: ClientConfig,
    reconnect: ReconnectConfig,
    events: Option<UnboundedSender<ClientEvent>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(config: ClientConfig, reconnect: ReconnectConfig) -> Self {
        Self {
            config,
            reconnect,
            events: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events: UnboundedSender<ClientEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Cancel this token to stop the supervisor and its current client
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> SupervisorExit {
        let mut backoff = ReconnectManager::new(self.reconnect.clone());
        let mut ever_verified = false;

        loop {
            if self.shutdown.is_cancelled() {
                return SupervisorExit::Shutdown;
            }

            let error = match ControlClient::connect(self.config.clone()).await {
                Ok(client) => {
                    let mut client = client.with_shutdown(self.shutdown.child_token());
                    if let Some(events) = &self.events {
                        client = client.with_events(events.clone());
                    }
                    match client.run().await {
                        ClientExit::VerifyFailed => return SupervisorExit::VerifyFailed,
                        ClientExit::Conflict => return SupervisorExit::Conflict,
                        ClientExit::Shutdown => return SupervisorExit::Shutdown,
                        ClientExit::Disconnected {
                            was_verified,
                            error,
                        } => {
                            if was_verified {
                                ever_verified = true;
                                backoff.reset();
                            }
                            error.unwrap_or_else(|| "connection closed by server".to_string())
                        }
                    }
                }
                Err(e) => e.to_string(),
            };

            if !ever_verified && self.reconnect.give_up_if_never_connected {
                error!("Could not establish a connection to the tunnel server: {}", error);
                return SupervisorExit::NeverConnected { error };
            }

            warn!(
                "Connection to tunnel server lost ({}), reconnecting in {:?}",
                error,
                backoff.current_backoff()
            );
            tokio::select! {
                waited = backoff.wait() => {
                    if waited.is_err() {
                        let attempts = backoff.attempt() - 1;
                        error!("Giving up after {} reconnection attempt(s)", attempts);
                        return SupervisorExit::GaveUp { attempts };
                    }
                }
                _ = self.shutdown.cancelled() => return SupervisorExit::Shutdown,
            }
            info!("Reconnecting to {} (attempt {})", self.config.server_addr(), backoff.attempt());
        }
    }
}

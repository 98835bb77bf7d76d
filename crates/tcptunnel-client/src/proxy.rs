//! Proxy leg: one local-service socket joined to one relay socket
//!
//! The local target is dialed first; the relay only after that succeeds. A
//! leg that never reaches the pipe stage reports a "failed before connect"
//! outcome so the caller can tell the server to release the parked public
//! connection.

use futures::FutureExt;
use tcptunnel_proto::{encode_signed, pipe_two_way, write_frame, RelayMessage};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// How a proxy leg ended
///
/// A leg reports exactly one outcome, whichever of its sockets fails first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegOutcome {
    /// The local target refused, errored or closed before the relay was joined
    LocalFailed { reason: String },
    /// The relay could not be reached or refused the handshake
    RelayFailed { reason: String },
    /// Both legs were joined and the pipe has finished; `sent` counts bytes
    /// from the local target toward the relay
    Finished { sent: u64, received: u64 },
}

impl LegOutcome {
    /// True when the public connection was never joined to the local target
    pub fn failed_before_connect(&self) -> bool {
        !matches!(self, LegOutcome::Finished { .. })
    }

    pub fn reason(&self) -> String {
        match self {
            LegOutcome::LocalFailed { reason } => format!("local target unavailable: {}", reason),
            LegOutcome::RelayFailed { reason } => format!("relay unavailable: {}", reason),
            LegOutcome::Finished { sent, received } => {
                format!("finished ({} bytes sent, {} bytes received)", sent, received)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyLeg {
    session: String,
    secret: String,
    local_addr: String,
    relay_addr: String,
}

impl ProxyLeg {
    pub fn new(
        session: impl Into<String>,
        secret: impl Into<String>,
        local_addr: impl Into<String>,
        relay_addr: impl Into<String>,
    ) -> Self {
        Self {
            session: session.into(),
            secret: secret.into(),
            local_addr: local_addr.into(),
            relay_addr: relay_addr.into(),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Connect both legs and pipe until either closes
    pub async fn run(self) -> LegOutcome {
        let local = match TcpStream::connect(&self.local_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "Session {}: failed to connect to local target {}: {}",
                    self.session, self.local_addr, e
                );
                return LegOutcome::LocalFailed {
                    reason: e.to_string(),
                };
            }
        };
        let _ = local.set_nodelay(true);
        debug!("Session {}: connected to {}", self.session, self.local_addr);

        let mut relay = tokio::select! {
            relay = TcpStream::connect(&self.relay_addr) => match relay {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(
                        "Session {}: failed to connect to relay {}: {}",
                        self.session, self.relay_addr, e
                    );
                    return LegOutcome::RelayFailed { reason: e.to_string() };
                }
            },
            reason = local_closed(&local) => {
                debug!("Session {}: local target went away during relay connect", self.session);
                return LegOutcome::LocalFailed { reason };
            }
        };
        let _ = relay.set_nodelay(true);

        // Last look at the local socket before committing the session
        let first = match local_closed(&local).now_or_never() {
            None => RelayMessage::Connected {
                session: self.session.clone(),
            },
            Some(reason) => {
                let failed = RelayMessage::Failed {
                    session: self.session.clone(),
                };
                if let Ok(frame) = encode_signed(&self.secret, &failed) {
                    let _ = write_frame(&mut relay, &frame).await;
                }
                return LegOutcome::LocalFailed { reason };
            }
        };

        let handshake = match encode_signed(&self.secret, &first) {
            Ok(frame) => write_frame(&mut relay, &frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = handshake {
            warn!("Session {}: relay handshake failed: {}", self.session, e);
            return LegOutcome::RelayFailed {
                reason: e.to_string(),
            };
        }

        debug!("Session {}: piping {} <-> {}", self.session, self.local_addr, self.relay_addr);
        let summary = pipe_two_way(local, relay).await;
        LegOutcome::Finished {
            sent: summary.a_to_b,
            received: summary.b_to_a,
        }
    }
}

/// Resolves once the peer of `stream` has closed it; pending while it is open
async fn local_closed(stream: &TcpStream) -> String {
    let mut peek_buf = [0u8; 1];
    match stream.peek(&mut peek_buf).await {
        Ok(0) => "closed by local target".to_string(),
        Err(e) => e.to_string(),
        // Data is waiting, so the socket is alive; leave it for the pipe
        Ok(_) => std::future::pending().await,
    }
}

//! Control connection to the tunnel server
//!
//! [`ControlClient::run`] drives one connection from handshake to its end
//! and reports why it ended as a [`ClientExit`]. Reconnecting is left to the
//! caller (see [`crate::reconnect::Supervisor`]).

use std::ops::ControlFlow;

use tcptunnel_proto::{
    decode_fields, method_of, now_millis, parse_fields, verify, ControlChannel, ControlMessage,
};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{join_host_port, ClientConfig};
use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::proxy::{LegOutcome, ProxyLeg};

/// Latest heartbeat round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingInfo {
    pub delay_ms: i64,
    /// Epoch ms at which the pong arrived
    pub received_at: i64,
}

/// Why a control connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientExit {
    /// The server's messages did not verify, it rejected the handshake, or it
    /// never acknowledged the handshake in time
    VerifyFailed,
    /// Another connection took over this client's name
    Conflict,
    /// Transport closed or failed
    Disconnected {
        was_verified: bool,
        error: Option<String>,
    },
    Shutdown,
}

/// Cheap handle for observing and stopping a running client
#[derive(Clone)]
pub struct ClientHandle {
    shutdown: CancellationToken,
    ping: watch::Receiver<Option<PingInfo>>,
}

impl ClientHandle {
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn last_ping(&self) -> Option<PingInfo> {
        *self.ping.borrow()
    }
}

pub struct ControlClient {
    config: ClientConfig,
    channel: ControlChannel,
    verified: bool,
    events: Option<UnboundedSender<ClientEvent>>,
    shutdown: CancellationToken,
    ping: watch::Sender<Option<PingInfo>>,
}

impl ControlClient {
    /// Open the control connection; the handshake is sent by [`ControlClient::run`]
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let address = config.server_addr();
        let channel = ControlChannel::connect(&address)
            .await
            .map_err(|e| ClientError::ConnectFailed {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        info!("Connected to tunnel server at {}", channel.peer_addr());

        let (ping, _) = watch::channel(None);
        Ok(Self {
            config,
            channel,
            verified: false,
            events: None,
            shutdown: CancellationToken::new(),
            ping,
        })
    }

    pub fn with_events(mut self, events: UnboundedSender<ClientEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Stop the client when `shutdown` is cancelled
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            shutdown: self.shutdown.clone(),
            ping: self.ping.subscribe(),
        }
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Handshake, then serve directives until the connection ends
    pub async fn run(mut self) -> ClientExit {
        let exit = self.serve().await;
        let _ = self.channel.close().await;
        match &exit {
            ClientExit::Disconnected { error, .. } => {
                warn!("Disconnected from tunnel server: {}", error.as_deref().unwrap_or("closed by server"))
            }
            other => info!("Control connection ended: {:?}", other),
        }
        exit
    }

    async fn serve(&mut self) -> ClientExit {
        self.emit(ClientEvent::Connected {
            server: self.channel.peer_addr(),
        });

        let handshake = ControlMessage::Verify {
            name: self.config.name.clone(),
        };
        if let Err(e) = self.channel.send_signed(&self.config.secret, &handshake).await {
            return ClientExit::Disconnected {
                was_verified: false,
                error: Some(e.to_string()),
            };
        }
        debug!("Handshake sent as {}", self.config.name);

        let verify_deadline = sleep(self.config.verify_timeout);
        tokio::pin!(verify_deadline);

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Legs die with this connection
        let legs_cancel = self.shutdown.child_token();
        let _legs_guard = legs_cancel.clone().drop_guard();
        let (leg_tx, mut leg_rx) = mpsc::unbounded_channel::<(String, LegOutcome)>();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return ClientExit::Shutdown,
                _ = &mut verify_deadline, if !self.verified => {
                    error!(
                        "Server did not acknowledge the handshake within {:?}",
                        self.config.verify_timeout
                    );
                    return ClientExit::VerifyFailed;
                }
                _ = heartbeat.tick() => {
                    let ping = ControlMessage::Ping { sent_at: now_millis() };
                    if let Err(e) = self.channel.send_signed(&self.config.secret, &ping).await {
                        return self.disconnected(Some(e.to_string()));
                    }
                }
                Some((session, outcome)) = leg_rx.recv() => {
                    if let ControlFlow::Break(exit) = self.leg_finished(session, outcome).await {
                        return exit;
                    }
                }
                frame = self.channel.recv_frame() => match frame {
                    Ok(Some(payload)) => {
                        if let ControlFlow::Break(exit) = self.handle_frame(&payload, &leg_tx, &legs_cancel) {
                            return exit;
                        }
                    }
                    Ok(None) => return self.disconnected(None),
                    Err(e) => return self.disconnected(Some(e.to_string())),
                },
            }
        }
    }

    fn disconnected(&self, error: Option<String>) -> ClientExit {
        ClientExit::Disconnected {
            was_verified: self.verified,
            error,
        }
    }

    fn handle_frame(
        &mut self,
        payload: &[u8],
        leg_tx: &UnboundedSender<(String, LegOutcome)>,
        legs_cancel: &CancellationToken,
    ) -> ControlFlow<ClientExit> {
        let fields = match decode_fields(payload) {
            Ok(fields) => fields,
            Err(e) => {
                error!("Malformed message from server: {}", e);
                return ControlFlow::Break(ClientExit::VerifyFailed);
            }
        };
        let outcome = verify(&self.config.secret, &fields);
        if !outcome.is_valid() {
            error!("Server message failed verification: {:?}", outcome);
            return ControlFlow::Break(ClientExit::VerifyFailed);
        }

        let message = match parse_fields::<ControlMessage>(&fields) {
            Ok(ControlMessage::Rejected) => {
                error!("Server rejected the handshake for {}", self.config.name);
                return ControlFlow::Break(ClientExit::VerifyFailed);
            }
            Ok(message) => Some(message),
            Err(_) => None,
        };

        if !self.verified {
            self.verified = true;
            info!("Verified by tunnel server as {}", self.config.name);
            self.emit(ClientEvent::Verified);
        }

        match message {
            Some(ControlMessage::Message { message }) => {
                info!("Server: {}", message);
                self.emit(ClientEvent::ServerMessage { message });
            }
            Some(ControlMessage::NewSession {
                session,
                local_port,
                remote_port,
            }) => self.start_leg(session, local_port, remote_port, leg_tx, legs_cancel),
            Some(ControlMessage::Conflict) => {
                error!(
                    "Another client connected with name {}, closing",
                    self.config.name
                );
                return ControlFlow::Break(ClientExit::Conflict);
            }
            Some(ControlMessage::Pong { sent_at }) => {
                let now = now_millis();
                let info = PingInfo {
                    delay_ms: now - sent_at,
                    received_at: now,
                };
                debug!("Heartbeat round trip {} ms", info.delay_ms);
                self.ping.send_replace(Some(info));
                self.emit(ClientEvent::Heartbeat(info));
            }
            Some(other) => {
                debug!("Ignoring {} from server", other.method());
                self.emit(ClientEvent::UnknownMethod {
                    method: Some(other.method().to_string()),
                });
            }
            None => {
                let method = method_of(&fields).map(str::to_string);
                debug!("Ignoring unknown method {:?} from server", method);
                self.emit(ClientEvent::UnknownMethod { method });
            }
        }
        ControlFlow::Continue(())
    }

    fn start_leg(
        &self,
        session: String,
        local_port: u16,
        relay_port: u16,
        leg_tx: &UnboundedSender<(String, LegOutcome)>,
        legs_cancel: &CancellationToken,
    ) {
        let leg = ProxyLeg::new(
            session.clone(),
            self.config.secret.clone(),
            join_host_port(&self.config.local_host, local_port),
            join_host_port(&self.config.server_host, relay_port),
        );
        debug!("Session {} → local port {}", session, local_port);
        self.emit(ClientEvent::SessionStarted {
            session: session.clone(),
            local_port,
        });

        let leg_tx = leg_tx.clone();
        let cancel = legs_cancel.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = leg.run() => outcome,
                _ = cancel.cancelled() => return,
            };
            let _ = leg_tx.send((session, outcome));
        });
    }

    async fn leg_finished(&mut self, session: String, outcome: LegOutcome) -> ControlFlow<ClientExit> {
        if outcome.failed_before_connect() {
            warn!("Session {} failed: {}", session, outcome.reason());
            let close = ControlMessage::CloseSession {
                session: session.clone(),
                message: outcome.reason(),
            };
            if let Err(e) = self.channel.send_signed(&self.config.secret, &close).await {
                return ControlFlow::Break(self.disconnected(Some(e.to_string())));
            }
        } else {
            debug!("Session {} {}", session, outcome.reason());
        }
        self.emit(ClientEvent::SessionClosed { session, outcome });
        ControlFlow::Continue(())
    }
}

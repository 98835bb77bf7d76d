//! Control server
//!
//! Accepts control connections, authenticates each one against the
//! credential table and keeps at most one verified connection per client
//! name. Public connections arriving on forwarded ports are parked in the
//! [`SessionAgent`] and announced to the owning client with a signed
//! `new_session` directive.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tcptunnel_proto::{
    decode_fields, generate_session_id, method_of, parse_fields, verify, ControlChannel,
    ControlMessage, Fields, CONNECTED_GREETING,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::SessionAgent;
use crate::config::{public_ports, rule_table, PortRule, ServerConfig};
use crate::connection::{ClientTarget, ConnectionHandle, ConnectionState, Outbound};
use crate::error::ServerError;
use crate::events::{EventSink, ServerEvent};
use crate::ports::{AcceptBackoff, PortEvent, PortManager};

pub use crate::connection::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

pub struct ControlServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    /// Client name → shared secret
    credentials: RwLock<HashMap<String, String>>,
    /// Public port → forwarding rule
    rules: RwLock<HashMap<u16, PortRule>>,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    /// Client name → the one verified connection holding it
    names: DashMap<String, ConnectionId>,
    agent: SessionAgent,
    ports: PortManager,
    port_events: Mutex<Option<UnboundedReceiver<PortEvent>>>,
    events: EventSink,
    shutdown: CancellationToken,
}

impl ControlServer {
    /// Bind the control and relay listeners and open the configured public ports
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let rules = rule_table(&config.port_rules)?;

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| ServerError::bind(config.listen_addr, e))?;
        let local_addr = listener.local_addr()?;
        let agent = SessionAgent::bind(config.relay_addr).await?;

        let (port_tx, port_rx) = mpsc::unbounded_channel();
        let ports = PortManager::new(config.public_host, port_tx);
        ports.reset(&public_ports(&rules)).await;

        info!(
            "Control server bound on {} (relay port {}, {} client(s), {} rule(s))",
            local_addr,
            agent.listen_port(),
            config.clients.len(),
            rules.len()
        );

        Ok(Self {
            listener,
            local_addr,
            credentials: RwLock::new(config.clients),
            rules: RwLock::new(rules),
            connections: DashMap::new(),
            names: DashMap::new(),
            agent,
            ports,
            port_events: Mutex::new(Some(port_rx)),
            events: EventSink::default(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Report state transitions on `events`
    pub fn with_events(mut self, events: UnboundedSender<ServerEvent>) -> Self {
        let sink = EventSink::new(events);
        self.agent.set_events(sink.clone());
        self.events = sink;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn relay_port(&self) -> u16 {
        self.agent.listen_port()
    }

    /// Run until [`ControlServer::shutdown`] is called
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let relay = {
            let server = Arc::clone(&self);
            tokio::spawn(async move { server.agent.run(server.shutdown.clone()).await })
        };
        if let Some(port_events) = self.port_events.lock().await.take() {
            tokio::spawn(Arc::clone(&self).dispatch_port_events(port_events));
        }

        info!("Control server accepting on {}", self.local_addr);
        let mut backoff = AcceptBackoff::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        backoff.reset();
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            server.handle_connection(stream, peer_addr).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept control connection: {}", e);
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
            }
        }

        info!("Control server shutting down");
        self.ports.close_all().await;
        let _ = relay.await;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Replace the credential table
    ///
    /// Verified connections whose name disappeared or whose secret changed are
    /// closed; every other connection and its sessions are left alone.
    pub async fn set_clients_password(&self, clients: HashMap<String, String>) {
        let mut credentials = self.credentials.write().await;
        let mut closed = 0;
        for entry in self.connections.iter() {
            if let ConnectionState::Verified { name, secret } = &entry.state {
                if clients.get(name) != Some(secret) {
                    info!(
                        "Credentials for client {} changed, closing connection {}",
                        name,
                        entry.key()
                    );
                    entry.close();
                    closed += 1;
                }
            }
        }
        info!(
            "Client credentials replaced ({} client(s), {} connection(s) closed)",
            clients.len(),
            closed
        );
        *credentials = clients;
    }

    /// Replace the forwarding rules and reconcile the public listeners
    pub async fn set_listen_ports(&self, rules: Vec<PortRule>) -> Result<(), ServerError> {
        let table = rule_table(&rules)?;
        let ports = public_ports(&table);
        *self.rules.write().await = table;
        self.ports.reset(&ports).await;
        info!("Forwarding rules replaced ({} public port(s))", ports.len());
        Ok(())
    }

    /// Name of the client currently online for `port`, if any
    pub async fn lookup_client_by_port(&self, port: u16) -> Option<String> {
        self.target_for_port(port)
            .await
            .map(|target| target.client_name)
    }

    /// Names of the verified clients, sorted
    pub fn online_clients(&self) -> Vec<String> {
        let mut names: Vec<String> = self.names.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Forwarded connections still waiting for their client's relay
    pub fn pending_sessions(&self) -> usize {
        self.agent.pending_count()
    }

    pub fn active_sessions(&self) -> usize {
        self.agent.active_count()
    }

    pub async fn active_ports(&self) -> Vec<u16> {
        self.ports.active_ports().await.into_iter().collect()
    }

    async fn target_for_port(&self, port: u16) -> Option<ClientTarget> {
        let rule = self.rules.read().await.get(&port).cloned()?;
        let id = *self.names.get(&rule.client_name)?;
        let handle = self.connections.get(&id)?;
        match &handle.state {
            ConnectionState::Verified { name, secret } => Some(ClientTarget {
                client_name: name.clone(),
                secret: secret.clone(),
                client_port: rule.client_port,
                outbound: handle.outbound.clone(),
            }),
            _ => None,
        }
    }

    async fn dispatch_port_events(self: Arc<Self>, mut port_events: UnboundedReceiver<PortEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = port_events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                PortEvent::Connection {
                    port,
                    stream,
                    peer_addr,
                } => self.forward(port, stream, peer_addr).await,
                PortEvent::Error { port, error } => {
                    warn!("Public port {} error: {}", port, error);
                    self.events.emit(ServerEvent::PortError {
                        port,
                        error: error.to_string(),
                    });
                }
                PortEvent::Closed { port } => {
                    self.events.emit(ServerEvent::PortClosed { port });
                }
            }
        }
    }

    /// Hand a public connection to the client owning `port`
    async fn forward(&self, port: u16, stream: TcpStream, peer_addr: SocketAddr) {
        let Some(target) = self.target_for_port(port).await else {
            debug!("No client online for port {}, dropping {}", port, peer_addr);
            self.events
                .emit(ServerEvent::NoClientOnline { port, peer_addr });
            return;
        };
        let _ = stream.set_nodelay(true);

        let session_id = generate_session_id();
        self.agent.add(
            session_id.clone(),
            target.client_name.clone(),
            target.secret,
            stream,
        );

        let directive = ControlMessage::NewSession {
            session: session_id.clone(),
            local_port: target.client_port,
            remote_port: self.agent.listen_port(),
        };
        if target.outbound.send(Outbound::Message(directive)).is_err() {
            // Connection task ended between lookup and send
            self.agent.remove(&session_id);
            return;
        }

        debug!(
            "Session {} created for {} on port {} → {}:{}",
            session_id, peer_addr, port, target.client_name, target.client_port
        );
        self.events.emit(ServerEvent::PortConnection {
            port,
            peer_addr,
            client: target.client_name.clone(),
        });
        self.events.emit(ServerEvent::SessionCreated {
            session: session_id,
            client: target.client_name,
            public_port: port,
        });
    }

    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let mut channel = match ControlChannel::new(stream) {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Dropping control connection from {}: {}", peer_addr, e);
                return;
            }
        };

        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.connections
            .insert(id, ConnectionHandle::new(peer_addr, tx));
        debug!("New control connection {} from {}", id, peer_addr);
        self.events
            .emit(ServerEvent::ConnectionAccepted { id, peer_addr });

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                outbound = rx.recv() => match outbound {
                    Some(Outbound::Message(msg)) => {
                        let Some(secret) = self.connection_secret(&id) else {
                            continue;
                        };
                        if let Err(e) = channel.send_signed(&secret, &msg).await {
                            warn!("Failed to send {} to {}: {}", msg.method(), peer_addr, e);
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => break,
                },
                frame = channel.recv_frame() => match frame {
                    Ok(Some(payload)) => {
                        if self.handle_frame(id, peer_addr, &mut channel, &payload).await == Flow::Close {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("Control connection {} closed by peer", id);
                        break;
                    }
                    Err(e) => {
                        warn!("Control connection {} error: {}", id, e);
                        break;
                    }
                },
            }
        }

        let _ = channel.close().await;
        self.connection_closed(id);
    }

    async fn handle_frame(
        &self,
        id: ConnectionId,
        peer_addr: SocketAddr,
        channel: &mut ControlChannel,
        payload: &[u8],
    ) -> Flow {
        let fields = match decode_fields(payload) {
            Ok(fields) => fields,
            Err(e) => {
                self.reject(peer_addr, format!("malformed payload: {}", e));
                return Flow::Close;
            }
        };
        let state = match self.connections.get(&id) {
            Some(handle) => handle.state.clone(),
            None => return Flow::Close,
        };
        match state {
            ConnectionState::Unverified => self.handshake(id, peer_addr, channel, fields).await,
            ConnectionState::Verified { name, secret } => {
                self.dispatch(peer_addr, &name, &secret, channel, fields)
                    .await
            }
            // Closing; nothing it says matters any more
            ConnectionState::Evicted { .. } => Flow::Continue,
        }
    }

    async fn handshake(
        &self,
        id: ConnectionId,
        peer_addr: SocketAddr,
        channel: &mut ControlChannel,
        fields: Fields,
    ) -> Flow {
        let Some(name) = fields
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            self.reject(peer_addr, "handshake without a name".to_string());
            return Flow::Close;
        };
        let Some(secret) = self.credentials.read().await.get(&name).cloned() else {
            self.reject(peer_addr, format!("unknown client {}", name));
            return Flow::Close;
        };

        let outcome = verify(&secret, &fields);
        if !outcome.is_valid() {
            let _ = channel.send_signed(&secret, &ControlMessage::Rejected).await;
            self.reject(
                peer_addr,
                format!("client {} failed verification: {:?}", name, outcome),
            );
            return Flow::Close;
        }

        if let Some(previous) = self.bind_name(id, &name, &secret) {
            self.evict(previous, &name);
        }

        let greeting = ControlMessage::Message {
            message: CONNECTED_GREETING.to_string(),
        };
        if let Err(e) = channel.send_signed(&secret, &greeting).await {
            warn!("Failed to acknowledge client {}: {}", name, e);
            return Flow::Close;
        }

        info!("Client {} verified from {}", name, peer_addr);
        self.events
            .emit(ServerEvent::ClientConnected { name, peer_addr });
        Flow::Continue
    }

    /// Messages from a verified connection
    async fn dispatch(
        &self,
        peer_addr: SocketAddr,
        name: &str,
        secret: &str,
        channel: &mut ControlChannel,
        fields: Fields,
    ) -> Flow {
        let outcome = verify(secret, &fields);
        if !outcome.is_valid() {
            self.reject(
                peer_addr,
                format!("message from {} failed verification: {:?}", name, outcome),
            );
            return Flow::Close;
        }

        match parse_fields::<ControlMessage>(&fields) {
            Ok(ControlMessage::Message { message }) => {
                info!("Message from {}: {}", name, message);
                self.events.emit(ServerEvent::ClientMessage {
                    name: name.to_string(),
                    message,
                });
            }
            Ok(ControlMessage::CloseSession { session, message }) => {
                if self.agent.session_owner(&session).as_deref() == Some(name) {
                    info!("Client {} closed session {}: {}", name, session, message);
                    self.agent.remove_unreachable(&session);
                } else {
                    debug!("Client {} asked to close unknown session {}", name, session);
                }
            }
            Ok(ControlMessage::Ping { sent_at }) => {
                if let Err(e) = channel
                    .send_signed(secret, &ControlMessage::Pong { sent_at })
                    .await
                {
                    warn!("Failed to answer ping from {}: {}", name, e);
                    return Flow::Close;
                }
            }
            Ok(ControlMessage::Verify { .. }) => {
                debug!("Client {} is already verified", name);
            }
            Ok(other) => self.unknown_method(name, Some(other.method().to_string())),
            Err(_) => self.unknown_method(name, method_of(&fields).map(str::to_string)),
        }
        Flow::Continue
    }

    fn unknown_method(&self, name: &str, method: Option<String>) {
        debug!("Ignoring method {:?} from {}", method, name);
        self.events.emit(ServerEvent::UnknownMethod {
            name: name.to_string(),
            method,
        });
    }

    /// Bind `name` to `id`; returns the connection that held it before
    fn bind_name(&self, id: ConnectionId, name: &str, secret: &str) -> Option<ConnectionId> {
        if let Some(mut handle) = self.connections.get_mut(&id) {
            handle.state = ConnectionState::Verified {
                name: name.to_string(),
                secret: secret.to_string(),
            };
        }
        self.names
            .insert(name.to_string(), id)
            .filter(|previous| *previous != id)
    }

    fn evict(&self, id: ConnectionId, name: &str) {
        let Some(mut handle) = self.connections.get_mut(&id) else {
            return;
        };
        if let ConnectionState::Verified { secret, .. } = handle.state.clone() {
            handle.state = ConnectionState::Evicted {
                name: name.to_string(),
                secret,
            };
        }
        handle.send(ControlMessage::Conflict);
        handle.close();

        warn!(
            "Client {} connected again, evicting connection {} from {}",
            name, id, handle.peer_addr
        );
        self.events.emit(ServerEvent::ClientEvicted {
            name: name.to_string(),
            peer_addr: handle.peer_addr,
        });
    }

    fn connection_secret(&self, id: &ConnectionId) -> Option<String> {
        self.connections
            .get(id)
            .and_then(|handle| handle.state.secret().map(str::to_string))
    }

    fn connection_closed(&self, id: ConnectionId) {
        let Some((_, handle)) = self.connections.remove(&id) else {
            return;
        };
        match &handle.state {
            ConnectionState::Verified { name, .. } => {
                // Only the current holder may drop the binding
                if self.names.remove_if(name, |_, holder| *holder == id).is_some() {
                    let purged = self.agent.remove_all_by_client_name(name);
                    info!(
                        "Client {} disconnected ({} session(s) purged)",
                        name, purged
                    );
                    self.events.emit(ServerEvent::ClientDisconnected {
                        name: name.clone(),
                        purged_sessions: purged,
                    });
                }
            }
            ConnectionState::Evicted { name, .. } => {
                debug!("Evicted connection {} of client {} closed", id, name);
            }
            ConnectionState::Unverified => {}
        }
        debug!("Control connection {} from {} closed", id, handle.peer_addr);
        self.events.emit(ServerEvent::ConnectionClosed {
            id,
            peer_addr: handle.peer_addr,
        });
    }

    fn reject(&self, peer_addr: SocketAddr, reason: String) {
        warn!("Rejected control connection from {}: {}", peer_addr, reason);
        self.events
            .emit(ServerEvent::ClientRejected { peer_addr, reason });
    }
}

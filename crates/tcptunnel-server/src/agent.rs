//! Relay listener and session index
//!
//! Every public connection the server forwards is parked here under a fresh
//! session id until the owning client dials the relay listener and claims it
//! with a signed `connected` message. Each parked connection is owned by its
//! own task, which buffers early bytes, watches for the public peer leaving
//! and finally runs the joined pipe.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tcptunnel_proto::{decode_fields, method_of, pipe_two_way, read_frame, verify};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ServerError;
use crate::events::{EventSink, ServerEvent, SessionEnd};
use crate::ports::AcceptBackoff;

/// Bytes a parked connection may buffer before it is claimed
const EARLY_BUFFER_LIMIT: usize = 64 * 1024;
const READ_CHUNK: usize = 8192;

/// What a parked connection's task is told to do
enum Claim {
    Pipe {
        relay: TcpStream,
        cancel: CancellationToken,
    },
    Discard(SessionEnd),
}

struct PendingSession {
    client_name: String,
    secret: String,
    claim: oneshot::Sender<Claim>,
}

struct ActiveSession {
    client_name: String,
    cancel: CancellationToken,
}

#[derive(Clone, Default)]
struct SessionIndex {
    pending: Arc<DashMap<String, PendingSession>>,
    active: Arc<DashMap<String, ActiveSession>>,
    events: EventSink,
}

pub struct SessionAgent {
    listener: TcpListener,
    local_addr: SocketAddr,
    index: SessionIndex,
}

impl SessionAgent {
    pub async fn bind(addr: SocketAddr) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::bind(addr, e))?;
        let local_addr = listener.local_addr()?;
        info!("Relay listener bound on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            index: SessionIndex::default(),
        })
    }

    pub fn set_events(&mut self, events: EventSink) {
        self.index.events = events;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Relay port advertised to clients in `new_session` directives
    pub fn listen_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Accept relay connections until `shutdown` fires, then drop every session
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut backoff = AcceptBackoff::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        backoff.reset();
                        debug!("New relay connection from {}", peer_addr);
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(self.index.clone().handle_relay(stream, peer_addr));
                    }
                    Err(e) => {
                        error!("Failed to accept relay connection: {}", e);
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
            }
        }
        self.close_all();
        info!("Relay listener on {} stopped", self.local_addr);
    }

    /// Park `public` under `session_id` until a relay claims it
    ///
    /// The session removes itself if the public peer closes first.
    pub fn add(&self, session_id: String, client_name: String, secret: String, public: TcpStream) {
        let (tx, rx) = oneshot::channel();
        debug!("Session {} parked for client {}", session_id, client_name);
        self.index.pending.insert(
            session_id.clone(),
            PendingSession {
                client_name,
                secret,
                claim: tx,
            },
        );
        tokio::spawn(self.index.clone().park(session_id, public, rx));
    }

    /// Destroy a pending or active session; false if it does not exist
    pub fn remove(&self, session_id: &str) -> bool {
        self.index.remove(session_id, SessionEnd::Removed)
    }

    /// Destroy a session whose client could not reach its local target
    pub fn remove_unreachable(&self, session_id: &str) -> bool {
        self.index.remove(session_id, SessionEnd::LocalUnreachable)
    }

    /// Destroy every pending and active session owned by `name`
    pub fn remove_all_by_client_name(&self, name: &str) -> usize {
        let mut purged = 0;
        // Dropping a pending entry drops its claim sender, which discards the parked socket
        self.index.pending.retain(|_, session| {
            let keep = session.client_name != name;
            if !keep {
                purged += 1;
            }
            keep
        });
        self.index.active.retain(|_, session| {
            let keep = session.client_name != name;
            if !keep {
                session.cancel.cancel();
                purged += 1;
            }
            keep
        });
        if purged > 0 {
            info!("Purged {} session(s) of client {}", purged, name);
        }
        purged
    }

    /// Owning client of a pending or active session
    pub fn session_owner(&self, session_id: &str) -> Option<String> {
        if let Some(session) = self.index.pending.get(session_id) {
            return Some(session.client_name.clone());
        }
        self.index
            .active
            .get(session_id)
            .map(|session| session.client_name.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.index.pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.index.active.len()
    }

    pub fn close_all(&self) {
        self.index.pending.clear();
        for session in self.index.active.iter() {
            session.cancel.cancel();
        }
        self.index.active.clear();
    }
}

impl SessionIndex {
    fn remove(&self, session_id: &str, reason: SessionEnd) -> bool {
        if let Some((_, pending)) = self.pending.remove(session_id) {
            let _ = pending.claim.send(Claim::Discard(reason));
            return true;
        }
        if let Some((_, active)) = self.active.remove(session_id) {
            active.cancel.cancel();
            return true;
        }
        false
    }

    /// Own a parked public connection for its whole life
    async fn park(
        self,
        session_id: String,
        mut public: TcpStream,
        mut claim_rx: oneshot::Receiver<Claim>,
    ) {
        let mut early = Vec::new();
        let mut buf = vec![0u8; READ_CHUNK];

        let claim = loop {
            let read_len = (EARLY_BUFFER_LIMIT - early.len()).min(READ_CHUNK);
            tokio::select! {
                claim = &mut claim_rx => break claim.ok(),
                read = public.read(&mut buf[..read_len]), if read_len > 0 => match read {
                    Ok(0) | Err(_) => {
                        if self.pending.remove(&session_id).is_some() {
                            debug!("Session {} closed by public peer before claim", session_id);
                            self.closed(&session_id, SessionEnd::PublicClosed);
                            return;
                        }
                        // A claim already took the entry; its sender resolves without awaiting
                        match (&mut claim_rx).await {
                            Ok(Claim::Pipe { .. }) => {
                                debug!("Session {} claimed after public peer left", session_id);
                                self.active.remove(&session_id);
                                self.closed(&session_id, SessionEnd::PublicClosed);
                            }
                            Ok(Claim::Discard(reason)) => self.closed(&session_id, reason),
                            Err(_) => {}
                        }
                        return;
                    }
                    Ok(n) => early.extend_from_slice(&buf[..n]),
                },
            }
        };

        let (mut relay, cancel) = match claim {
            Some(Claim::Pipe { relay, cancel }) => (relay, cancel),
            Some(Claim::Discard(reason)) => {
                debug!("Session {} discarded: {:?}", session_id, reason);
                self.closed(&session_id, reason);
                return;
            }
            None => {
                self.closed(&session_id, SessionEnd::Removed);
                return;
            }
        };

        if !early.is_empty() {
            if let Err(e) = relay.write_all(&early).await {
                warn!("Session {} relay failed while replaying early bytes: {}", session_id, e);
                self.active.remove(&session_id);
                self.closed(
                    &session_id,
                    SessionEnd::PipeClosed {
                        sent: 0,
                        received: 0,
                    },
                );
                return;
            }
        }

        debug!("Session {} piping", session_id);
        self.events.emit(ServerEvent::SessionPiped {
            session: session_id.clone(),
        });

        let reason = tokio::select! {
            summary = pipe_two_way(public, relay) => SessionEnd::PipeClosed {
                sent: summary.a_to_b + early.len() as u64,
                received: summary.b_to_a,
            },
            _ = cancel.cancelled() => SessionEnd::Removed,
        };
        self.active.remove(&session_id);
        self.closed(&session_id, reason);
    }

    fn closed(&self, session_id: &str, reason: SessionEnd) {
        debug!("Session {} closed: {:?}", session_id, reason);
        self.events.emit(ServerEvent::SessionClosed {
            session: session_id.to_string(),
            reason,
        });
    }

    /// Read and check the first message of a relay connection
    async fn handle_relay(self, mut relay: TcpStream, peer_addr: SocketAddr) {
        let frame = match read_frame(&mut relay).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return self.reject(peer_addr, "closed before first message"),
            Err(e) => return self.reject(peer_addr, &format!("unreadable first message: {}", e)),
        };
        let fields = match decode_fields(&frame) {
            Ok(fields) => fields,
            Err(_) => return self.reject(peer_addr, "malformed first message"),
        };
        let Some(session_id) = fields
            .get("session")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return self.reject(peer_addr, "missing session id");
        };

        let Some((client_name, secret)) = self
            .pending
            .get(&session_id)
            .map(|s| (s.client_name.clone(), s.secret.clone()))
        else {
            return self.reject(peer_addr, "unknown session id");
        };

        let outcome = verify(&secret, &fields);
        if !outcome.is_valid() {
            return self.reject(peer_addr, &format!("signature check failed: {:?}", outcome));
        }

        if method_of(&fields) != Some("connected") {
            // The client could not reach its local target
            info!("Session {} failed on client {}", session_id, client_name);
            self.remove(&session_id, SessionEnd::LocalUnreachable);
            return;
        }

        let cancel = CancellationToken::new();
        match self.active.entry(session_id.clone()) {
            Entry::Occupied(_) => return self.reject(peer_addr, "session already claimed"),
            Entry::Vacant(slot) => {
                slot.insert(ActiveSession {
                    client_name: client_name.clone(),
                    cancel: cancel.clone(),
                });
            }
        }
        let Some((_, pending)) = self.pending.remove(&session_id) else {
            self.active.remove(&session_id);
            return self.reject(peer_addr, "session already claimed");
        };

        info!("Session {} claimed by {} ({})", session_id, client_name, peer_addr);
        if pending.claim.send(Claim::Pipe { relay, cancel }).is_err() {
            // Parked task already saw the public peer leave
            self.active.remove(&session_id);
            self.closed(&session_id, SessionEnd::PublicClosed);
        }
    }

    fn reject(&self, peer_addr: SocketAddr, reason: &str) {
        warn!("Rejected relay connection from {}: {}", peer_addr, reason);
        self.events.emit(ServerEvent::RelayRejected {
            peer_addr,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tcptunnel_proto::{encode_signed, write_frame, RelayMessage};
    use tokio::time::timeout;

    async fn start_agent() -> Arc<SessionAgent> {
        let agent = Arc::new(
            SessionAgent::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let runner = agent.clone();
        tokio::spawn(async move { runner.run(CancellationToken::new()).await });
        agent
    }

    /// (peer side, server side) of a loopback connection
    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (peer, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (peer.unwrap(), accepted.unwrap().0)
    }

    async fn relay_with(agent: &SessionAgent, secret: &str, msg: &RelayMessage) -> TcpStream {
        let mut relay = TcpStream::connect(agent.local_addr()).await.unwrap();
        let frame = encode_signed(secret, msg).unwrap();
        write_frame(&mut relay, &frame).await.unwrap();
        relay
    }

    fn connected(session: &str) -> RelayMessage {
        RelayMessage::Connected {
            session: session.to_string(),
        }
    }

    async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .expect("timed out reading")
            .unwrap();
        buf
    }

    async fn assert_closed(stream: &mut TcpStream) {
        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("stream was not closed");
        assert!(matches!(read, Ok(0) | Err(_)), "unexpected read: {:?}", read);
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_session_is_claimed_only_once() {
        let agent = start_agent().await;
        let (mut visitor, public) = tcp_pair().await;
        agent.add("s1".into(), "A".into(), "x".into(), public);

        let mut relay = relay_with(&agent, "x", &connected("s1")).await;
        visitor.write_all(b"hello").await.unwrap();
        assert_eq!(read_exactly(&mut relay, 5).await, b"hello");
        assert_eq!(agent.pending_count(), 0);
        assert_eq!(agent.active_count(), 1);

        // A second valid claim is refused and does not disturb the pair
        let mut second = relay_with(&agent, "x", &connected("s1")).await;
        assert_closed(&mut second).await;

        relay.write_all(b"back").await.unwrap();
        assert_eq!(read_exactly(&mut visitor, 4).await, b"back");
    }

    #[tokio::test]
    async fn test_early_bytes_are_replayed_on_claim() {
        let agent = start_agent().await;
        let (mut visitor, public) = tcp_pair().await;
        agent.add("s1".into(), "A".into(), "x".into(), public);

        visitor.write_all(b"sent before claim").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut relay = relay_with(&agent, "x", &connected("s1")).await;
        assert_eq!(read_exactly(&mut relay, 17).await, b"sent before claim");
    }

    #[tokio::test]
    async fn test_public_close_before_claim_removes_session() {
        let agent = start_agent().await;
        let (visitor, public) = tcp_pair().await;
        agent.add("s1".into(), "A".into(), "x".into(), public);
        assert_eq!(agent.pending_count(), 1);

        drop(visitor);
        wait_until(|| agent.pending_count() == 0).await;
    }

    #[tokio::test]
    async fn test_claim_racing_public_close_leaves_no_bookkeeping() {
        let agent = start_agent().await;
        for i in 0..40 {
            let session = format!("s{}", i);
            let (visitor, public) = tcp_pair().await;
            agent.add(session.clone(), "A".into(), "x".into(), public);
            drop(visitor);

            let (mut client_side, relay) = tcp_pair().await;
            let frame = encode_signed("x", &connected(&session)).unwrap();
            write_frame(&mut client_side, &frame).await.unwrap();
            let peer_addr = client_side.local_addr().unwrap();
            agent.index.clone().handle_relay(relay, peer_addr).await;
        }
        wait_until(|| agent.pending_count() == 0 && agent.active_count() == 0).await;
    }

    #[tokio::test]
    async fn test_bad_claims_are_rejected() {
        let agent = start_agent().await;
        let (_visitor, public) = tcp_pair().await;
        agent.add("s1".into(), "A".into(), "x".into(), public);

        let mut wrong_secret = relay_with(&agent, "not-x", &connected("s1")).await;
        assert_closed(&mut wrong_secret).await;

        let mut unknown = relay_with(&agent, "x", &connected("nope")).await;
        assert_closed(&mut unknown).await;

        let mut garbage = TcpStream::connect(agent.local_addr()).await.unwrap();
        write_frame(&mut garbage, b"not json").await.unwrap();
        assert_closed(&mut garbage).await;

        assert_eq!(agent.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_claim_destroys_parked_connection() {
        let agent = start_agent().await;
        let (mut visitor, public) = tcp_pair().await;
        agent.add("s1".into(), "A".into(), "x".into(), public);

        let failed = RelayMessage::Failed {
            session: "s1".to_string(),
        };
        let mut relay = relay_with(&agent, "x", &failed).await;
        assert_closed(&mut visitor).await;
        assert_closed(&mut relay).await;
        assert_eq!(agent.pending_count(), 0);
        assert_eq!(agent.active_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_all_by_client_name() {
        let agent = start_agent().await;
        let (mut v1, p1) = tcp_pair().await;
        let (mut v2, p2) = tcp_pair().await;
        let (_v3, p3) = tcp_pair().await;
        agent.add("s1".into(), "A".into(), "x".into(), p1);
        agent.add("s2".into(), "A".into(), "x".into(), p2);
        agent.add("s3".into(), "B".into(), "y".into(), p3);

        // s2 becomes active
        let mut relay = relay_with(&agent, "x", &connected("s2")).await;
        v2.write_all(b"hi").await.unwrap();
        assert_eq!(read_exactly(&mut relay, 2).await, b"hi");
        assert_eq!(agent.session_owner("s2").as_deref(), Some("A"));

        assert_eq!(agent.remove_all_by_client_name("A"), 2);
        assert_closed(&mut v1).await;
        assert_closed(&mut v2).await;
        assert_closed(&mut relay).await;
        assert_eq!(agent.pending_count(), 1);
        assert_eq!(agent.session_owner("s3").as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_remove_pending_session() {
        let agent = start_agent().await;
        let (mut visitor, public) = tcp_pair().await;
        agent.add("s1".into(), "A".into(), "x".into(), public);

        assert!(agent.remove("s1"));
        assert!(!agent.remove("s1"));
        assert_closed(&mut visitor).await;
    }
}

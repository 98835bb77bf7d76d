//! Public port listener set
//!
//! [`PortManager::reset`] reconciles the running listeners with a desired
//! port set. Ports present in both sets keep their listener, so connections
//! already accepted on them are never disturbed.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause between failed accepts (fd exhaustion and the like), reset by a success
pub(crate) struct AcceptBackoff {
    next: Duration,
}

impl AcceptBackoff {
    pub(crate) fn new() -> Self {
        Self {
            next: ACCEPT_BACKOFF_MIN,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.next = ACCEPT_BACKOFF_MIN;
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(ACCEPT_BACKOFF_MAX);
        delay
    }
}

/// Listener notifications delivered to the owner
#[derive(Debug)]
pub enum PortEvent {
    Connection {
        port: u16,
        stream: TcpStream,
        peer_addr: SocketAddr,
    },
    Error {
        port: u16,
        error: std::io::Error,
    },
    Closed {
        port: u16,
    },
}

struct ActiveListener {
    cancel: CancellationToken,
    local_addr: SocketAddr,
}

pub struct PortManager {
    host: IpAddr,
    listeners: Mutex<HashMap<u16, ActiveListener>>,
    events: UnboundedSender<PortEvent>,
}

impl PortManager {
    pub fn new(host: IpAddr, events: UnboundedSender<PortEvent>) -> Self {
        Self {
            host,
            listeners: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Open listeners for new ports and close listeners for removed ones
    ///
    /// A port that fails to bind is reported through [`PortEvent::Error`] and
    /// left out of the active set; the remaining ports still bind.
    pub async fn reset(&self, ports: &BTreeSet<u16>) {
        let mut listeners = self.listeners.lock().await;

        let removed: Vec<u16> = listeners
            .keys()
            .filter(|port| !ports.contains(port))
            .copied()
            .collect();
        for port in removed {
            if let Some(listener) = listeners.remove(&port) {
                info!("Closing public listener on {}", listener.local_addr);
                listener.cancel.cancel();
            }
        }

        for &port in ports {
            if listeners.contains_key(&port) {
                continue;
            }
            let addr = SocketAddr::new(self.host, port);
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    let local_addr = listener.local_addr().unwrap_or(addr);
                    info!("Public listener bound on {}", local_addr);
                    let cancel = CancellationToken::new();
                    tokio::spawn(accept_loop(
                        port,
                        listener,
                        cancel.clone(),
                        self.events.clone(),
                    ));
                    listeners.insert(port, ActiveListener { cancel, local_addr });
                }
                Err(e) => {
                    error!("Failed to bind public port {}: {}", addr, e);
                    let _ = self.events.send(PortEvent::Error { port, error: e });
                }
            }
        }
    }

    /// Ports with a running listener
    pub async fn active_ports(&self) -> BTreeSet<u16> {
        self.listeners.lock().await.keys().copied().collect()
    }

    pub async fn close_all(&self) {
        self.reset(&BTreeSet::new()).await;
    }
}

async fn accept_loop(
    port: u16,
    listener: TcpListener,
    cancel: CancellationToken,
    events: UnboundedSender<PortEvent>,
) {
    let mut backoff = AcceptBackoff::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    backoff.reset();
                    debug!("New public connection from {} on port {}", peer_addr, port);
                    if events
                        .send(PortEvent::Connection { port, stream, peer_addr })
                        .is_err()
                    {
                        // Owner is gone
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to accept on public port {}: {}", port, e);
                    let _ = events.send(PortEvent::Error { port, error: e });
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            },
        }
    }

    // Release the socket before reporting, so the port can be rebound right away
    drop(listener);
    debug!("Public listener on port {} closed", port);
    let _ = events.send(PortEvent::Closed { port });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use tokio::time::timeout;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_accept_backoff_grows_and_resets() {
        let mut backoff = AcceptBackoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    /// Distinct ports that were free a moment ago
    async fn free_ports<const N: usize>() -> [u16; N] {
        let mut held = Vec::with_capacity(N);
        let mut ports = [0u16; N];
        for port in ports.iter_mut() {
            let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
            *port = listener.local_addr().unwrap().port();
            held.push(listener);
        }
        ports
    }

    async fn next_event(rx: &mut UnboundedReceiver<PortEvent>) -> PortEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for port event")
            .expect("port event channel closed")
    }

    async fn accept_on(rx: &mut UnboundedReceiver<PortEvent>, expected: u16) -> TcpStream {
        match next_event(rx).await {
            PortEvent::Connection { port, stream, .. } => {
                assert_eq!(port, expected);
                stream
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reset_is_idempotent_and_keeps_connections() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = PortManager::new(LOCALHOST, tx);

        let [p1, p2, p3] = free_ports::<3>().await;
        manager.reset(&BTreeSet::from([p1, p2])).await;
        assert_eq!(manager.active_ports().await, BTreeSet::from([p1, p2]));

        let mut client = TcpStream::connect((LOCALHOST, p2)).await.unwrap();
        let mut accepted = accept_on(&mut rx, p2).await;

        // Same set again: nothing is closed or rebound
        manager.reset(&BTreeSet::from([p1, p2])).await;
        assert_eq!(manager.active_ports().await, BTreeSet::from([p1, p2]));
        assert!(rx.try_recv().is_err());

        // Swap p1 for p3
        manager.reset(&BTreeSet::from([p2, p3])).await;
        assert_eq!(manager.active_ports().await, BTreeSet::from([p2, p3]));
        match next_event(&mut rx).await {
            PortEvent::Closed { port } => assert_eq!(port, p1),
            other => panic!("unexpected event: {:?}", other),
        }

        // The connection accepted on p2 still carries data
        client.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");

        // p1 no longer accepts, p2 and p3 do
        assert!(TcpStream::connect((LOCALHOST, p1)).await.is_err());
        let _c2 = TcpStream::connect((LOCALHOST, p2)).await.unwrap();
        accept_on(&mut rx, p2).await;
        let _c3 = TcpStream::connect((LOCALHOST, p3)).await.unwrap();
        accept_on(&mut rx, p3).await;
    }

    #[tokio::test]
    async fn test_bind_failure_does_not_block_other_ports() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = PortManager::new(LOCALHOST, tx);

        let occupied = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let taken = occupied.local_addr().unwrap().port();
        let [free] = free_ports::<1>().await;

        manager.reset(&BTreeSet::from([taken, free])).await;
        assert_eq!(manager.active_ports().await, BTreeSet::from([free]));
        match next_event(&mut rx).await {
            PortEvent::Error { port, .. } => assert_eq!(port, taken),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_all_reports_each_port() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = PortManager::new(LOCALHOST, tx);
        let [p1, p2] = free_ports::<2>().await;
        manager.reset(&BTreeSet::from([p1, p2])).await;

        manager.close_all().await;
        assert!(manager.active_ports().await.is_empty());

        let mut closed = BTreeSet::new();
        for _ in 0..2 {
            match next_event(&mut rx).await {
                PortEvent::Closed { port } => {
                    closed.insert(port);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(closed, BTreeSet::from([p1, p2]));
    }
}

//! Connection tracking for proxied flows
//!
//! Each TCP/UDP 5-tuple handed to the proxy gets one relay session: a task
//! holding an outbound connection to the packet's destination and a bounded
//! queue of payloads to send on it. The flow table is the only shared
//! mutable state in the data plane; every lookup, insert and removal happens
//! under its single mutex, which is never held across an await.

use crate::packet::{Packet, Transport};
use crate::telemetry::{Counter, MetricsRegistry};
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Receive buffer for peer replies
const RELAY_BUFFER_SIZE: usize = 65535;

/// Flow key (5-tuple)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Transport,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FlowKey {
    pub fn new(protocol: Transport, src: SocketAddr, dst: SocketAddr) -> Self {
        Self { protocol, src, dst }
    }

    /// Key of the reply direction
    pub fn reverse(&self) -> Self {
        Self {
            protocol: self.protocol,
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.src, self.dst)
    }
}

/// Timeouts for relay sessions
#[derive(Debug, Clone)]
pub struct FlowTimeouts {
    /// Outbound connect (default: 5 seconds)
    pub connect: Duration,
    /// Idle TCP session (default: 2 hours)
    pub tcp_idle: Duration,
    /// Idle UDP session (default: 5 minutes)
    pub udp_idle: Duration,
}

impl FlowTimeouts {
    pub fn idle(&self, protocol: Transport) -> Duration {
        match protocol {
            Transport::Tcp => self.tcp_idle,
            Transport::Udp => self.udp_idle,
        }
    }
}

impl Default for FlowTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            tcp_idle: Duration::from_secs(7200),
            udp_idle: Duration::from_secs(300),
        }
    }
}

/// One relayed flow
#[derive(Debug)]
pub struct Session {
    id: u64,
    key: FlowKey,
    tx: mpsc::Sender<Vec<u8>>,
    closed: AtomicBool,
    last_active: Mutex<Instant>,
    cancel: CancellationToken,
    /// Bytes sent to the peer
    pub tx_bytes: Counter,
    /// Bytes received from the peer
    pub rx_bytes: Counter,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Update last-active time
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_active.lock() {
            *last = Instant::now();
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    /// Queue a payload for the peer without waiting.
    fn enqueue(&self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        self.tx.try_send(payload.to_vec()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::Backpressure(self.key.to_string()),
            mpsc::error::TrySendError::Closed(_) => Error::Device {
                name: "proxy".into(),
                reason: format!("session for {} is closing", self.key),
            },
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
    }
}

/// Flow table of relay sessions
pub struct ConnectionTracker {
    sessions: Mutex<HashMap<FlowKey, Arc<Session>>>,
    next_id: AtomicU64,
    timeouts: FlowTimeouts,
    queue_capacity: usize,
    cancel: CancellationToken,
    metrics: Arc<MetricsRegistry>,
}

impl ConnectionTracker {
    pub fn new(
        timeouts: FlowTimeouts,
        queue_capacity: usize,
        cancel: CancellationToken,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeouts,
            queue_capacity: queue_capacity.max(1),
            cancel,
            metrics,
        })
    }

    fn table(&self) -> MutexGuard<'_, HashMap<FlowKey, Arc<Session>>> {
        // A panic elsewhere cannot leave the map half-updated
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Find the live session for a flow, refreshing its last-active time.
    pub fn lookup(&self, key: &FlowKey) -> Option<Arc<Session>> {
        let sessions = self.table();
        sessions
            .get(key)
            .filter(|s| !s.is_closed())
            .map(|s| {
                s.touch();
                Arc::clone(s)
            })
    }

    /// Return the live session for `key`, creating it if needed.
    pub fn create(self: &Arc<Self>, key: FlowKey) -> Arc<Session> {
        let mut sessions = self.table();
        self.get_or_spawn(&mut sessions, key)
    }

    /// Remove the session with `id` for `key`; a newer session for the same
    /// flow is left alone. Returns true if an entry was removed.
    pub fn remove(&self, key: &FlowKey, id: u64) -> bool {
        let mut sessions = self.table();
        match sessions.get(key) {
            Some(session) if session.id == id => {
                session.close();
                sessions.remove(key);
                self.metrics.flows_closed.inc();
                true
            }
            _ => false,
        }
    }

    /// Relay the transport payload of `pkt` through its flow's session.
    pub fn forward(self: &Arc<Self>, pkt: &Packet) -> Result<usize> {
        let key = pkt
            .flow_key()
            .ok_or(Error::UnsupportedProtocol(pkt.protocol()))?;
        let payload = pkt
            .payload()
            .ok_or_else(|| Error::InvalidPacket(format!("no transport payload in {}", pkt)))?;

        let mut sessions = self.table();
        let session = match sessions.get(&key) {
            Some(existing) if !existing.is_closed() => {
                existing.touch();
                Arc::clone(existing)
            }
            _ => self.get_or_spawn(&mut sessions, key),
        };
        session.enqueue(payload)?;
        Ok(pkt.len())
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Close every session.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = self.table().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close();
            self.metrics.flows_closed.inc();
        }
        if !drained.is_empty() {
            info!("Closed {} proxied flows", drained.len());
        }
    }

    fn get_or_spawn(
        self: &Arc<Self>,
        sessions: &mut HashMap<FlowKey, Arc<Session>>,
        key: FlowKey,
    ) -> Arc<Session> {
        if let Some(existing) = sessions.get(&key).filter(|s| !s.is_closed()) {
            return Arc::clone(existing);
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let session = Arc::new(Session {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key,
            tx,
            closed: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
            cancel: self.cancel.child_token(),
            tx_bytes: Counter::new(),
            rx_bytes: Counter::new(),
        });
        sessions.insert(key, Arc::clone(&session));
        self.metrics.flows_created.inc();
        debug!("New flow {}", key);

        let tracker = Arc::clone(self);
        let relay_session = Arc::clone(&session);
        tokio::spawn(async move {
            tracker.relay(relay_session, rx).await;
        });
        session
    }

    async fn relay(self: Arc<Self>, session: Arc<Session>, rx: mpsc::Receiver<Vec<u8>>) {
        let key = session.key;
        let outcome = tokio::select! {
            _ = session.cancel.cancelled() => Ok(()),
            result = self.run_session(&session, rx) => result,
        };
        match outcome {
            Ok(()) => debug!(
                "Flow {} finished (tx={} rx={})",
                key,
                session.tx_bytes.get(),
                session.rx_bytes.get()
            ),
            Err(e) => warn!("Flow {} terminated: {}", key, e),
        }
        self.remove(&key, session.id);
    }

    async fn run_session(
        &self,
        session: &Session,
        mut rx: mpsc::Receiver<Vec<u8>>,
    ) -> Result<()> {
        let key = session.key;
        let (mut reader, mut writer) =
            match tokio::time::timeout(self.timeouts.connect, connect(&key)).await {
                Ok(Ok(halves)) => halves,
                Ok(Err(e)) => {
                    self.metrics.dial_failures.inc();
                    return Err(Error::Io(e));
                }
                Err(_) => {
                    self.metrics.dial_failures.inc();
                    return Err(Error::Device {
                        name: "proxy".into(),
                        reason: format!("connect to {} timed out", key.dst),
                    });
                }
            };
        debug!("Connected to {} for {}", key.dst, key);

        let idle_timeout = self.timeouts.idle(key.protocol);
        let check_every =
            (idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut idle_check = tokio::time::interval(check_every);
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(payload) => {
                        writer.send(&payload).await?;
                        session.tx_bytes.add(payload.len() as u64);
                        trace!("Relayed {} bytes for {}", payload.len(), key);
                    }
                    None => return Ok(()),
                },
                received = reader.recv(&mut buf) => match received? {
                    Some(n) => {
                        session.rx_bytes.add(n as u64);
                        session.touch();
                    }
                    None => {
                        debug!("Peer {} closed {}", key.dst, key);
                        return Ok(());
                    }
                },
                _ = idle_check.tick() => {
                    if session.idle_for() >= idle_timeout {
                        debug!("Flow {} idle for {:?}", key, idle_timeout);
                        return Ok(());
                    }
                }
            }
        }
    }
}

enum PeerReader {
    Tcp(OwnedReadHalf),
    Udp(Arc<UdpSocket>),
}

impl PeerReader {
    /// `Ok(None)` once the peer has closed the connection.
    async fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<Option<usize>> {
        match self {
            PeerReader::Tcp(half) => match half.read(buf).await? {
                0 => Ok(None),
                n => Ok(Some(n)),
            },
            PeerReader::Udp(socket) => socket.recv(buf).await.map(Some),
        }
    }
}

enum PeerWriter {
    Tcp(OwnedWriteHalf),
    Udp(Arc<UdpSocket>),
}

impl PeerWriter {
    async fn send(&mut self, payload: &[u8]) -> std::io::Result<()> {
        match self {
            PeerWriter::Tcp(half) => half.write_all(payload).await,
            PeerWriter::Udp(socket) => socket.send(payload).await.map(|_| ()),
        }
    }
}

async fn connect(key: &FlowKey) -> std::io::Result<(PeerReader, PeerWriter)> {
    match key.protocol {
        Transport::Tcp => {
            let stream = TcpStream::connect(key.dst).await?;
            let (read, write) = stream.into_split();
            Ok((PeerReader::Tcp(read), PeerWriter::Tcp(write)))
        }
        Transport::Udp => {
            let bind: SocketAddr = if key.dst.is_ipv4() {
                (Ipv4Addr::UNSPECIFIED, 0).into()
            } else {
                (Ipv6Addr::UNSPECIFIED, 0).into()
            };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(key.dst).await?;
            let socket = Arc::new(socket);
            Ok((PeerReader::Udp(Arc::clone(&socket)), PeerWriter::Udp(socket)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build;

    fn tracker(timeouts: FlowTimeouts) -> (Arc<ConnectionTracker>, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new());
        let tracker =
            ConnectionTracker::new(timeouts, 64, CancellationToken::new(), metrics.clone());
        (tracker, metrics)
    }

    fn udp_packet(dst: SocketAddr, payload: &[u8]) -> Packet {
        let dst_ip = match dst {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => unreachable!("tests use IPv4"),
        };
        Packet::from_bytes(&build::udp4(
            (Ipv4Addr::new(10, 0, 0, 2), 40000),
            (dst_ip, dst.port()),
            payload,
        ))
        .unwrap()
    }

    #[test]
    fn test_key_reverse() {
        let key = FlowKey::new(
            Transport::Tcp,
            "192.168.1.100:12345".parse().unwrap(),
            "93.184.216.34:80".parse().unwrap(),
        );
        let reply = key.reverse();
        assert_eq!(reply.src, key.dst);
        assert_eq!(reply.dst, key.src);
        assert_eq!(reply.reverse(), key);
        assert_eq!(key.to_string(), "tcp 192.168.1.100:12345 -> 93.184.216.34:80");
    }

    #[test]
    fn test_default_timeouts() {
        let t = FlowTimeouts::default();
        assert_eq!(t.idle(Transport::Tcp), Duration::from_secs(7200));
        assert_eq!(t.idle(Transport::Udp), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_unsupported_protocol_rejected() {
        let (tracker, _) = tracker(FlowTimeouts::default());
        let icmp = Packet::from_bytes(&build::ipv4(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            crate::packet::protocol::ICMP,
            None,
            &[8, 0, 0, 0],
        ))
        .unwrap();
        assert!(matches!(
            tracker.forward(&icmp),
            Err(Error::UnsupportedProtocol(1))
        ));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_create_is_unique_per_flow() {
        let (tracker, metrics) = tracker(FlowTimeouts::default());
        let key = FlowKey::new(
            Transport::Udp,
            "10.0.0.2:40000".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
        );

        let first = tracker.create(key);
        let second = tracker.create(key);
        assert_eq!(first.id(), second.id());
        assert_eq!(tracker.len(), 1);
        assert_eq!(metrics.flows_created.get(), 1);
        assert_eq!(tracker.lookup(&key).map(|s| s.id()), Some(first.id()));
        tracker.shutdown();
    }

    #[tokio::test]
    async fn test_remove_ignores_stale_id() {
        let (tracker, _) = tracker(FlowTimeouts::default());
        let key = FlowKey::new(
            Transport::Udp,
            "10.0.0.2:40000".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
        );
        let session = tracker.create(key);

        assert!(!tracker.remove(&key, session.id() + 100));
        assert_eq!(tracker.len(), 1);

        assert!(tracker.remove(&key, session.id()));
        assert!(session.is_closed());
        assert!(tracker.lookup(&key).is_none());

        // A later packet creates a fresh session instead of reviving the old one
        let fresh = tracker.create(key);
        assert_ne!(fresh.id(), session.id());
        tracker.shutdown();
    }

    #[tokio::test]
    async fn test_udp_flow_relays_payloads() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let (tracker, _) = tracker(FlowTimeouts::default());

        for payload in [&b"one"[..], b"two"] {
            let pkt = udp_packet(server_addr, payload);
            assert_eq!(tracker.forward(&pkt).unwrap(), pkt.len());
        }
        assert_eq!(tracker.len(), 1);

        let mut buf = [0u8; 64];
        for expected in [&b"one"[..], b"two"] {
            let (n, _) = tokio::time::timeout(Duration::from_secs(2), server.recv_from(&mut buf))
                .await
                .expect("relay did not deliver")
                .unwrap();
            assert_eq!(&buf[..n], expected);
        }
        tracker.shutdown();
    }

    #[tokio::test]
    async fn test_idle_session_removed() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let timeouts = FlowTimeouts {
            udp_idle: Duration::from_millis(50),
            ..FlowTimeouts::default()
        };
        let (tracker, metrics) = tracker(timeouts);

        tracker
            .forward(&udp_packet(server.local_addr().unwrap(), b"ping"))
            .unwrap();
        assert_eq!(tracker.len(), 1);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !tracker.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("idle session was not removed");
        assert_eq!(metrics.flows_closed.get(), 1);
    }

    #[tokio::test]
    async fn test_tcp_peer_close_removes_session() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tracker, _) = tracker(FlowTimeouts::default());

        let pkt = Packet::from_bytes(&build::tcp4(
            (Ipv4Addr::new(10, 0, 0, 2), 50000),
            (Ipv4Addr::LOCALHOST, addr.port()),
            b"hello",
        ))
        .unwrap();
        tracker.forward(&pkt).unwrap();

        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        drop(conn);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !tracker.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("closed session was not removed");
    }

    #[tokio::test]
    async fn test_short_tcp_data_offset_not_relayed() {
        let (tracker, metrics) = tracker(FlowTimeouts::default());
        let mut data = build::tcp4(
            (Ipv4Addr::new(10, 0, 0, 2), 50002),
            (Ipv4Addr::LOCALHOST, 9),
            b"hello",
        );
        data[32] = 0;
        let pkt = Packet::from_bytes(&data).unwrap();

        assert!(matches!(
            tracker.forward(&pkt),
            Err(Error::InvalidPacket(_))
        ));
        assert!(tracker.is_empty());
        assert_eq!(metrics.flows_created.get(), 0);
    }

    #[tokio::test]
    async fn test_dial_failure_counts_and_removes() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let (tracker, metrics) = tracker(FlowTimeouts::default());
        let pkt = Packet::from_bytes(&build::tcp4(
            (Ipv4Addr::new(10, 0, 0, 2), 50001),
            (Ipv4Addr::LOCALHOST, port),
            b"x",
        ))
        .unwrap();
        tracker.forward(&pkt).unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !tracker.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("failed session was not removed");
        assert_eq!(metrics.dial_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_all() {
        let (tracker, _) = tracker(FlowTimeouts::default());
        let a = tracker.create(FlowKey::new(
            Transport::Udp,
            "10.0.0.2:1".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
        ));
        let b = tracker.create(FlowKey::new(
            Transport::Udp,
            "10.0.0.2:2".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
        ));
        tracker.shutdown();
        assert!(tracker.is_empty());
        assert!(a.is_closed() && b.is_closed());
    }
}

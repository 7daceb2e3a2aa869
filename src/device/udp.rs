//! UDP tunnel socket
//!
//! Each datagram carries exactly one IP packet, as produced by a remote
//! instance. Writes go to the endpoint a route action stored in the
//! packet metadata.

use super::{Device, DeviceKind, Lifecycle};
use crate::packet::Packet;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

/// Bound UDP socket exchanging tunneled IP packets
pub struct UdpTunnel {
    addr: String,
    name: String,
    lifecycle: Lifecycle,
    socket: RwLock<Option<Arc<UdpSocket>>>,
}

impl UdpTunnel {
    /// Create a tunnel that will bind `addr` (host:port) on start.
    pub fn new(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self {
            name: format!("udp://{}", addr),
            addr,
            lifecycle: Lifecycle::new(),
            socket: RwLock::new(None),
        }
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket().and_then(|s| s.local_addr().ok())
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.read().ok().and_then(|guard| guard.clone())
    }

    fn running_socket(&self) -> Result<Arc<UdpSocket>> {
        self.lifecycle.ensure_running(&self.name)?;
        self.socket().ok_or_else(|| Error::NotRunning {
            name: self.name.clone(),
        })
    }
}

#[async_trait]
impl Device for UdpTunnel {
    async fn start(&self) -> Result<()> {
        self.lifecycle.begin_start(&self.name)?;

        let socket = match UdpSocket::bind(&self.addr).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.lifecycle.abort_start();
                return Err(Error::Device {
                    name: self.name.clone(),
                    reason: format!("failed to bind: {}", e),
                });
            }
        };
        let local = socket
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| self.addr.clone());

        if let Ok(mut guard) = self.socket.write() {
            *guard = Some(socket);
        }
        if !self.lifecycle.set_running() {
            // stopped while binding
            self.socket.write().ok().and_then(|mut guard| guard.take());
            return Err(Error::NotRunning {
                name: self.name.clone(),
            });
        }
        info!("Listening on {}", local);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        let socket = self.socket.write().ok().and_then(|mut guard| guard.take());
        if socket.is_some() {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Tunnel
    }

    async fn read(&self, pkt: &mut Packet, deadline: Instant) -> Result<usize> {
        let socket = self.running_socket()?;
        match timeout_at(deadline, socket.recv_from(pkt.buffer_mut())).await {
            Ok(Ok((len, origin))) => {
                pkt.meta.origin = Some(origin);
                Ok(len)
            }
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_elapsed) => Ok(0),
        }
    }

    async fn write(&self, pkt: &Packet, deadline: Instant) -> Result<usize> {
        let socket = self.running_socket()?;
        let endpoint = pkt.meta.endpoint.ok_or_else(|| Error::NoEndpoint {
            device: self.name.clone(),
        })?;
        match timeout_at(deadline, socket.send_to(pkt.as_bytes(), endpoint)).await {
            Ok(Ok(len)) => Ok(len),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_elapsed) => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn sample() -> Vec<u8> {
        build::udp4(
            (Ipv4Addr::new(192, 168, 1, 7), 40000),
            (Ipv4Addr::new(10, 8, 0, 1), 9000),
            b"tunneled",
        )
    }

    #[tokio::test]
    async fn test_tunnel_roundtrip_over_loopback() {
        let a = UdpTunnel::new("127.0.0.1:0");
        let b = UdpTunnel::new("127.0.0.1:0");
        a.start().await.unwrap();
        b.start().await.unwrap();

        let data = sample();
        let mut out = Packet::from_bytes(&data).unwrap();
        out.meta.endpoint = b.local_addr();
        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(a.write(&out, deadline).await.unwrap(), data.len());

        let mut inbound = Packet::with_capacity(1600);
        let deadline = Instant::now() + Duration::from_secs(2);
        let len = b.read(&mut inbound, deadline).await.unwrap();
        assert_eq!(len, data.len());
        inbound.parse(len).unwrap();
        assert_eq!(inbound.as_bytes(), &data[..]);
        assert_eq!(inbound.meta.origin, a.local_addr());

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_timeout_is_not_an_error() {
        let dev = UdpTunnel::new("127.0.0.1:0");
        dev.start().await.unwrap();

        let mut pkt = Packet::with_capacity(1600);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(dev.read(&mut pkt, deadline).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_requires_endpoint() {
        let dev = UdpTunnel::new("127.0.0.1:0");
        dev.start().await.unwrap();

        let pkt = Packet::from_bytes(&sample()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(matches!(
            dev.write(&pkt, deadline).await,
            Err(Error::NoEndpoint { .. })
        ));
    }

    #[tokio::test]
    async fn test_bind_conflict_fails_start() {
        let first = UdpTunnel::new("127.0.0.1:0");
        first.start().await.unwrap();
        let taken = first.local_addr().unwrap();

        let second = UdpTunnel::new(taken.to_string());
        assert!(matches!(second.start().await, Err(Error::Device { .. })));
        // stop after a failed start is still safe
        assert!(second.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dev = UdpTunnel::new("127.0.0.1:0");
        dev.start().await.unwrap();
        assert!(dev.stop().await.is_ok());
        assert!(dev.stop().await.is_ok());
        assert_eq!(dev.local_addr(), None);

        let mut pkt = Packet::with_capacity(64);
        assert!(matches!(
            dev.read(&mut pkt, Instant::now()).await,
            Err(Error::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_start_binds_once() {
        let dev = UdpTunnel::new("127.0.0.1:0");
        let (a, b) = tokio::join!(dev.start(), dev.start());

        let oks = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(oks, 1, "results: {:?} {:?}", a, b);
        assert!(
            matches!(a, Err(Error::AlreadyStarted { .. }))
                || matches!(b, Err(Error::AlreadyStarted { .. }))
        );
        let bound = dev.local_addr().unwrap();
        assert!(matches!(
            dev.start().await,
            Err(Error::AlreadyStarted { .. })
        ));
        assert_eq!(dev.local_addr(), Some(bound));
    }

    #[tokio::test]
    async fn test_start_retry_after_bind_failure() {
        let first = UdpTunnel::new("127.0.0.1:0");
        first.start().await.unwrap();
        let taken = first.local_addr().unwrap();

        let second = UdpTunnel::new(taken.to_string());
        assert!(second.start().await.is_err());
        first.stop().await.unwrap();
        second.start().await.unwrap();
        assert_eq!(second.local_addr(), Some(taken));
    }

    #[tokio::test]
    async fn test_oversized_datagram_fails_parse() {
        let dev = UdpTunnel::new("127.0.0.1:0");
        dev.start().await.unwrap();

        let data = build::udp4(
            (Ipv4Addr::new(192, 168, 1, 7), 40000),
            (Ipv4Addr::new(10, 8, 0, 1), 9000),
            &[0xAB; 1972],
        );
        assert_eq!(data.len(), 2000);
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&data, dev.local_addr().unwrap()).unwrap();

        let mut pkt = Packet::with_capacity(1600);
        let deadline = Instant::now() + Duration::from_secs(2);
        let len = dev.read(&mut pkt, deadline).await.unwrap();
        assert_eq!(len, 1600);
        assert!(matches!(pkt.parse(len), Err(Error::InvalidPacket(_))));
        assert!(!pkt.is_parsed());
        assert_eq!(pkt.payload(), None);
    }

    #[test]
    fn test_name_has_scheme() {
        assert_eq!(UdpTunnel::new("0.0.0.0:9999").name(), "udp://0.0.0.0:9999");
    }
}

//! Raw IP packet buffers
//!
//! A [`Packet`] owns a buffer sized to the configured maximum packet size.
//! Devices read into it, [`Packet::parse`] validates the IP header once, and
//! the header accessors then read fields straight from the buffer.

mod pool;

pub use pool::PacketPool;

use crate::dataplane::FlowKey;
use crate::device::DeviceKind;
use crate::{Error, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Minimum IPv4 header size (without options)
pub const IPV4_HEADER_SIZE: usize = 20;

/// Fixed IPv6 header size
pub const IPV6_HEADER_SIZE: usize = 40;

/// UDP header size
pub const UDP_HEADER_SIZE: usize = 8;

/// Minimum TCP header size
pub const TCP_MIN_HEADER_SIZE: usize = 20;

/// IP protocol numbers
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const ICMPV6: u8 = 58;
}

/// IP version of a parsed packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// Transport protocols the proxy and port matching understand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            protocol::TCP => Some(Transport::Tcp),
            protocol::UDP => Some(Transport::Udp),
            _ => None,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Transport::Tcp => protocol::TCP,
            Transport::Udp => protocol::UDP,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-packet metadata filled in along the pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Sender address, for packets received from a socket
    pub origin: Option<SocketAddr>,
    /// Device the packet was read from
    pub source: Option<DeviceKind>,
    /// Remote endpoint set by a route action
    pub endpoint: Option<SocketAddr>,
}

/// Raw IP packet backed by an owned buffer
pub struct Packet {
    buffer: Vec<u8>,
    len: usize,
    version: Option<IpVersion>,
    transport_offset: usize,
    pub meta: Metadata,
}

impl Packet {
    /// Allocates a packet able to hold `max_size` bytes.
    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            buffer: vec![0u8; max_size],
            len: 0,
            version: None,
            transport_offset: 0,
            meta: Metadata::default(),
        }
    }

    /// Copies `data` into a new packet and parses it.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut pkt = Self::with_capacity(data.len());
        pkt.buffer.copy_from_slice(data);
        pkt.parse(data.len())?;
        Ok(pkt)
    }

    /// Whole backing buffer, for devices to read into.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Validates the first `len` bytes of the buffer as an IP packet.
    pub fn parse(&mut self, len: usize) -> Result<()> {
        self.version = None;
        self.transport_offset = 0;

        let len = len.min(self.buffer.len());
        self.len = len;

        if len < IPV4_HEADER_SIZE {
            return Err(Error::ShortPacket {
                len,
                need: IPV4_HEADER_SIZE,
            });
        }

        let (version, offset) = match self.buffer[0] >> 4 {
            4 => {
                let header_len = ((self.buffer[0] & 0x0F) as usize) * 4;
                if header_len < IPV4_HEADER_SIZE {
                    return Err(Error::InvalidPacket(format!(
                        "IPv4 header length {} below minimum",
                        header_len
                    )));
                }
                if header_len > len {
                    return Err(Error::InvalidPacket(format!(
                        "IPv4 header length {} exceeds packet length {}",
                        header_len, len
                    )));
                }
                (IpVersion::V4, header_len)
            }
            6 => {
                if len < IPV6_HEADER_SIZE {
                    return Err(Error::ShortPacket {
                        len,
                        need: IPV6_HEADER_SIZE,
                    });
                }
                (IpVersion::V6, IPV6_HEADER_SIZE)
            }
            other => return Err(Error::UnsupportedVersion(other)),
        };

        // A read into a too-small buffer is cut short; the IP length field
        // still holds the original size. Link-layer padding is trimmed.
        let declared = match version {
            IpVersion::V4 => u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize,
            IpVersion::V6 => {
                IPV6_HEADER_SIZE + u16::from_be_bytes([self.buffer[4], self.buffer[5]]) as usize
            }
        };
        if declared < offset {
            return Err(Error::InvalidPacket(format!(
                "IP length {} shorter than header length {}",
                declared, offset
            )));
        }
        if declared > len {
            return Err(Error::InvalidPacket(format!(
                "truncated packet: IP length {} but only {} bytes read",
                declared, len
            )));
        }
        let len = declared;
        self.len = len;

        let proto = match version {
            IpVersion::V4 => self.buffer[9],
            IpVersion::V6 => self.buffer[6],
        };
        if Transport::from_u8(proto).is_some() && offset + 4 > len {
            return Err(Error::InvalidPacket(format!(
                "truncated transport header: {} bytes at offset {}",
                len - offset,
                offset
            )));
        }

        self.version = Some(version);
        self.transport_offset = offset;
        Ok(())
    }

    /// Clears length, parse state and metadata; keeps the allocation.
    pub fn reset(&mut self) {
        self.len = 0;
        self.version = None;
        self.transport_offset = 0;
        self.meta = Metadata::default();
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    pub fn is_parsed(&self) -> bool {
        self.version.is_some()
    }

    pub fn version(&self) -> Option<IpVersion> {
        self.version
    }

    pub fn protocol(&self) -> u8 {
        match self.version {
            Some(IpVersion::V4) => self.buffer[9],
            Some(IpVersion::V6) => self.buffer[6],
            None => 0,
        }
    }

    pub fn transport(&self) -> Option<Transport> {
        Transport::from_u8(self.protocol())
    }

    pub fn src_addr(&self) -> IpAddr {
        match self.version {
            Some(IpVersion::V4) => IpAddr::V4(self.ipv4_at(12)),
            Some(IpVersion::V6) => IpAddr::V6(self.ipv6_at(8)),
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }

    pub fn dst_addr(&self) -> IpAddr {
        match self.version {
            Some(IpVersion::V4) => IpAddr::V4(self.ipv4_at(16)),
            Some(IpVersion::V6) => IpAddr::V6(self.ipv6_at(24)),
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }

    /// Offset of the transport header (IHL * 4 for IPv4, 40 for IPv6)
    pub fn transport_offset(&self) -> usize {
        self.transport_offset
    }

    /// Source port (TCP/UDP only)
    pub fn src_port(&self) -> Option<u16> {
        self.port_at(0)
    }

    /// Destination port (TCP/UDP only)
    pub fn dst_port(&self) -> Option<u16> {
        self.port_at(2)
    }

    /// Transport payload (TCP/UDP only)
    pub fn payload(&self) -> Option<&[u8]> {
        let offset = self.transport_offset;
        let header_len = match self.transport()? {
            Transport::Udp => UDP_HEADER_SIZE,
            Transport::Tcp => {
                if offset + TCP_MIN_HEADER_SIZE > self.len {
                    return None;
                }
                let data_offset = ((self.buffer[offset + 12] >> 4) as usize) * 4;
                if data_offset < TCP_MIN_HEADER_SIZE {
                    return None;
                }
                data_offset
            }
        };
        let start = offset + header_len;
        if start > self.len {
            return None;
        }
        Some(&self.buffer[start..self.len])
    }

    /// 5-tuple of a TCP/UDP packet
    pub fn flow_key(&self) -> Option<FlowKey> {
        let protocol = self.transport()?;
        Some(FlowKey::new(
            protocol,
            SocketAddr::new(self.src_addr(), self.src_port()?),
            SocketAddr::new(self.dst_addr(), self.dst_port()?),
        ))
    }

    fn port_at(&self, delta: usize) -> Option<u16> {
        self.transport()?;
        let at = self.transport_offset + delta;
        if at + 2 > self.len {
            return None;
        }
        Some(u16::from_be_bytes([self.buffer[at], self.buffer[at + 1]]))
    }

    fn ipv4_at(&self, at: usize) -> Ipv4Addr {
        Ipv4Addr::new(
            self.buffer[at],
            self.buffer[at + 1],
            self.buffer[at + 2],
            self.buffer[at + 3],
        )
    }

    fn ipv6_at(&self, at: usize) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.buffer[at..at + 16]);
        Ipv6Addr::from(octets)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len)
            .field("version", &self.version)
            .field("meta", &self.meta)
            .finish()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_parsed() {
            return write!(f, "unparsed len: {}", self.len);
        }
        let (src, dst) = (self.src_addr(), self.dst_addr());
        match (self.transport(), self.src_port(), self.dst_port()) {
            (Some(t), Some(sp), Some(dp)) => write!(
                f,
                "{}({} -> {}) len: {}",
                t,
                SocketAddr::new(src, sp),
                SocketAddr::new(dst, dp),
                self.len
            ),
            _ => match self.protocol() {
                protocol::ICMP => write!(f, "icmp({} -> {}) len: {}", src, dst, self.len),
                protocol::ICMPV6 => write!(f, "icmp6({} -> {}) len: {}", src, dst, self.len),
                other => write!(f, "ip({} -> {}) proto: {} len: {}", src, dst, other, self.len),
            },
        }
    }
}

/// Test packet builders shared by unit and integration tests.
#[doc(hidden)]
pub mod build {
    use super::protocol;
    use std::net::{Ipv4Addr, Ipv6Addr};

    /// IPv4 packet with a minimal header and an optional UDP or TCP header.
    pub fn ipv4(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        proto: u8,
        ports: Option<(u16, u16)>,
        payload: &[u8],
    ) -> Vec<u8> {
        let l4_len = match (proto, ports) {
            (protocol::UDP, Some(_)) => 8,
            (protocol::TCP, Some(_)) => 20,
            _ => 0,
        };
        let total = 20 + l4_len + payload.len();
        let mut buf = vec![0u8; total];
        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        buf[8] = 64;
        buf[9] = proto;
        buf[12..16].copy_from_slice(&src.octets());
        buf[16..20].copy_from_slice(&dst.octets());
        if let Some((sp, dp)) = ports {
            buf[20..22].copy_from_slice(&sp.to_be_bytes());
            buf[22..24].copy_from_slice(&dp.to_be_bytes());
            if proto == protocol::UDP {
                buf[24..26].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
            } else if proto == protocol::TCP {
                buf[32] = 5 << 4;
            }
        }
        buf[20 + l4_len..].copy_from_slice(payload);
        buf
    }

    /// IPv4 UDP packet.
    pub fn udp4(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16), payload: &[u8]) -> Vec<u8> {
        ipv4(src.0, dst.0, protocol::UDP, Some((src.1, dst.1)), payload)
    }

    /// IPv4 TCP packet (data offset 5, no flags).
    pub fn tcp4(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16), payload: &[u8]) -> Vec<u8> {
        ipv4(src.0, dst.0, protocol::TCP, Some((src.1, dst.1)), payload)
    }

    /// IPv6 UDP packet.
    pub fn udp6(src: (Ipv6Addr, u16), dst: (Ipv6Addr, u16), payload: &[u8]) -> Vec<u8> {
        let total = 40 + 8 + payload.len();
        let mut buf = vec![0u8; total];
        buf[0] = 0x60;
        buf[4..6].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        buf[6] = protocol::UDP;
        buf[7] = 64;
        buf[8..24].copy_from_slice(&src.0.octets());
        buf[24..40].copy_from_slice(&dst.0.octets());
        buf[40..42].copy_from_slice(&src.1.to_be_bytes());
        buf[42..44].copy_from_slice(&dst.1.to_be_bytes());
        buf[44..46].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        buf[48..].copy_from_slice(payload);
        buf
    }
}

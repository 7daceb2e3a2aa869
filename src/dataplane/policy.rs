//! Policy table
//!
//! An ordered list of rules, each matching on:
//! - Source prefix
//! - Destination prefix
//! - Transport protocol and destination port
//!
//! The first rule whose criteria all match decides where a packet goes.
//! Rules are parsed once at load time; the table is immutable afterwards.

use crate::config::PolicyConfig;
use crate::device::DeviceKind;
use crate::packet::{Packet, Transport};
use crate::{Error, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use tracing::{debug, error};

/// IP prefix (IPv4 or IPv6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpCidr {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpCidr {
    /// Create a CIDR, masking host bits off `addr`
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(Error::Parse(format!(
                "prefix length {} out of range for {}",
                prefix_len, addr
            )));
        }
        Ok(Self {
            addr: Self::network_addr(addr, prefix_len),
            prefix_len,
        })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check if an address is within this prefix. Families never mix.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.addr, addr) {
            (IpAddr::V4(network), IpAddr::V4(target)) => {
                let mask = v4_mask(self.prefix_len);
                (u32::from(network) & mask) == (u32::from(*target) & mask)
            }
            (IpAddr::V6(network), IpAddr::V6(target)) => {
                let mask = v6_mask(self.prefix_len);
                (u128::from(network) & mask) == (u128::from(*target) & mask)
            }
            _ => false,
        }
    }

    fn network_addr(addr: IpAddr, prefix_len: u8) -> IpAddr {
        match addr {
            IpAddr::V4(a) => IpAddr::V4(Ipv4Addr::from(u32::from(a) & v4_mask(prefix_len))),
            IpAddr::V6(a) => IpAddr::V6(Ipv6Addr::from(u128::from(a) & v6_mask(prefix_len))),
        }
    }
}

fn v4_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        !0u32 << (32 - prefix_len)
    }
}

fn v6_mask(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        !0u128 << (128 - prefix_len)
    }
}

impl FromStr for IpCidr {
    type Err = Error;

    /// Parse from string like "192.168.1.0/24" or "2001:db8::/32"
    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::Parse(format!("missing prefix length in {:?}", s)))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| Error::Parse(format!("invalid address in {:?}", s)))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| Error::Parse(format!("invalid prefix length in {:?}", s)))?;
        Self::new(addr, prefix_len)
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Transport protocol with an optional destination port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMatch {
    pub protocol: Transport,
    /// `None` matches any port of `protocol`
    pub port: Option<u16>,
}

impl PortMatch {
    pub fn matches(&self, pkt: &Packet) -> bool {
        if pkt.transport() != Some(self.protocol) {
            return false;
        }
        match self.port {
            Some(port) => pkt.dst_port() == Some(port),
            None => true,
        }
    }
}

impl FromStr for PortMatch {
    type Err = Error;

    /// Parse "tcp:443", "udp:53", or a bare "tcp" / "udp"
    fn from_str(s: &str) -> Result<Self> {
        let spec = s.trim().to_ascii_lowercase();
        let (proto, port) = match spec.split_once(':') {
            Some((proto, port)) => (proto, port),
            None => (spec.as_str(), ""),
        };
        let protocol = match proto {
            "tcp" => Transport::Tcp,
            "udp" => Transport::Udp,
            _ => return Err(Error::Parse(format!("unknown protocol in port spec {:?}", s))),
        };
        let port = if port.is_empty() {
            None
        } else {
            match port.parse::<u16>() {
                Ok(p) if p != 0 => Some(p),
                _ => return Err(Error::Parse(format!("invalid port in {:?}", s))),
            }
        };
        Ok(Self { protocol, port })
    }
}

impl fmt::Display for PortMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.protocol, port),
            None => write!(f, "{}", self.protocol),
        }
    }
}

/// What to do with a matching packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Discard silently
    Drop,
    /// Deliver to the local TUN interface
    Local,
    /// Terminate and relay through the proxy
    Proxy,
    /// Send through the UDP tunnel to a remote endpoint
    Route(SocketAddr),
}

impl Action {
    /// Device kind that carries out this action
    pub fn target(&self) -> DeviceKind {
        match self {
            Action::Drop => DeviceKind::Drop,
            Action::Local => DeviceKind::Local,
            Action::Proxy => DeviceKind::Proxy,
            Action::Route(_) => DeviceKind::Tunnel,
        }
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        match self {
            Action::Route(endpoint) => Some(*endpoint),
            _ => None,
        }
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s {
            "drop" => Ok(Action::Drop),
            "local" => Ok(Action::Local),
            "proxy" => Ok(Action::Proxy),
            _ => {
                let target = s
                    .strip_prefix("route=")
                    .ok_or_else(|| Error::Parse(format!("unknown action {:?}", s)))?;
                // Resolved once here; host names are not re-resolved later
                let endpoint = target
                    .to_socket_addrs()
                    .map_err(|e| Error::Parse(format!("cannot resolve {:?}: {}", target, e)))?
                    .next()
                    .ok_or_else(|| Error::Parse(format!("no address for {:?}", target)))?;
                Ok(Action::Route(endpoint))
            }
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Drop => f.write_str("drop"),
            Action::Local => f.write_str("local"),
            Action::Proxy => f.write_str("proxy"),
            Action::Route(endpoint) => write!(f, "route={}", endpoint),
        }
    }
}

/// A single policy rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub src: Option<IpCidr>,
    pub dst: Option<IpCidr>,
    pub port: Option<PortMatch>,
    pub action: Action,
}

impl PolicyRule {
    /// Parse a configured rule. A rule must set at least one criterion.
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        let src = parse_optional::<IpCidr>(&config.src_addr)
            .map_err(|e| Error::Policy(format!("src_addr: {}", e)))?;
        let dst = parse_optional::<IpCidr>(&config.dst_addr)
            .map_err(|e| Error::Policy(format!("dst_addr: {}", e)))?;
        let port = parse_optional::<PortMatch>(&config.dst_port)
            .map_err(|e| Error::Policy(format!("dst_port: {}", e)))?;

        if src.is_none() && dst.is_none() && port.is_none() {
            return Err(Error::Policy("rule has no match criteria".into()));
        }
        if config.action.trim().is_empty() {
            return Err(Error::Policy("rule has no action".into()));
        }
        let action = config
            .action
            .parse()
            .map_err(|e| Error::Policy(format!("action: {}", e)))?;

        Ok(Self {
            src,
            dst,
            port,
            action,
        })
    }

    /// Check if a parsed packet meets every criterion set on this rule
    pub fn matches(&self, pkt: &Packet) -> bool {
        if let Some(ref cidr) = self.src {
            if !cidr.contains(&pkt.src_addr()) {
                return false;
            }
        }

        if let Some(ref cidr) = self.dst {
            if !cidr.contains(&pkt.dst_addr()) {
                return false;
            }
        }

        if let Some(ref port) = self.port {
            if !port.matches(pkt) {
                return false;
            }
        }

        true
    }

    pub fn to_config(&self) -> PolicyConfig {
        PolicyConfig {
            src_addr: self.src.map(|c| c.to_string()).unwrap_or_default(),
            dst_addr: self.dst.map(|c| c.to_string()).unwrap_or_default(),
            dst_port: self.port.map(|p| p.to_string()).unwrap_or_default(),
            action: self.action.to_string(),
        }
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let any = "*".to_string();
        write!(
            f,
            "src={} dst={} port={} -> {}",
            self.src.map(|c| c.to_string()).unwrap_or_else(|| any.clone()),
            self.dst.map(|c| c.to_string()).unwrap_or_else(|| any.clone()),
            self.port.map(|p| p.to_string()).unwrap_or(any),
            self.action
        )
    }
}

fn parse_optional<T: FromStr<Err = Error>>(value: &str) -> Result<Option<T>> {
    let value = value.trim();
    if value.is_empty() {
        Ok(None)
    } else {
        value.parse().map(Some)
    }
}

/// Ordered, first-match-wins rule list
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    rules: Vec<PolicyRule>,
}

impl PolicyTable {
    /// Build the table in configuration order. Rules that fail to parse or
    /// whose action targets a device kind not in `available` are logged and
    /// skipped.
    pub fn build(configs: &[PolicyConfig], available: &[DeviceKind]) -> Self {
        let mut rules = Vec::with_capacity(configs.len());
        for (index, config) in configs.iter().enumerate() {
            let rule = match PolicyRule::from_config(config) {
                Ok(rule) => rule,
                Err(e) => {
                    error!("Skipping policy #{}: {}", index, e);
                    continue;
                }
            };
            let target = rule.action.target();
            if !available.contains(&target) {
                error!(
                    "Skipping policy #{}: no {} device for action {}",
                    index, target, rule.action
                );
                continue;
            }
            debug!("Policy #{}: {}", index, rule);
            rules.push(rule);
        }
        Self { rules }
    }

    pub fn from_rules(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    /// First matching rule, if any
    pub fn evaluate(&self, pkt: &Packet) -> Option<&PolicyRule> {
        self.rules.iter().find(|rule| rule.matches(pkt))
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn to_config(&self) -> Vec<PolicyConfig> {
        self.rules.iter().map(PolicyRule::to_config).collect()
    }
}

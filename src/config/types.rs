//! Configuration types

use crate::telemetry::LogConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

/// User-defined configuration (config.toml)
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// UDP tunnel bind address
    #[serde(default = "default_address")]
    pub address: String,
    /// Largest packet a device may read, in bytes
    #[serde(default = "default_max_buffer_size", alias = "maxBufferSize")]
    pub max_buffer_size: usize,
    /// Local TUN interface; omitted means no `local` device
    #[serde(default)]
    pub tun: Option<TunConfig>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: default_address(),
            max_buffer_size: default_max_buffer_size(),
            tun: None,
            engine: EngineConfig::default(),
            proxy: ProxyConfig::default(),
            log: None,
            policies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunConfig {
    #[serde(default = "default_tun_name")]
    pub name: String,
    /// Interface address in CIDR form, e.g. "10.10.0.1/24"
    pub address: Option<String>,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
}

impl TunConfig {
    /// Parse `address` into an IPv4 address and prefix length.
    pub fn parse_address(&self) -> Result<Option<(Ipv4Addr, u8)>> {
        let Some(address) = self.address.as_deref() else {
            return Ok(None);
        };
        let invalid = || Error::Config(format!("tun.address: invalid IPv4 CIDR {:?}", address));
        let (addr, prefix) = address.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }
        Ok(Some((addr, prefix)))
    }
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            address: None,
            mtu: default_mtu(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Egress queue depth per device
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl EngineConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_tcp_idle_timeout_secs")]
    pub tcp_idle_timeout_secs: u64,
    #[serde(default = "default_udp_idle_timeout_secs")]
    pub udp_idle_timeout_secs: u64,
    /// Payload queue depth per session
    #[serde(default = "default_session_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            tcp_idle_timeout_secs: default_tcp_idle_timeout_secs(),
            udp_idle_timeout_secs: default_udp_idle_timeout_secs(),
            queue_capacity: default_session_queue_capacity(),
        }
    }
}

/// One `[[policies]]` entry. Empty strings mean "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default, alias = "srcAddr", skip_serializing_if = "String::is_empty")]
    pub src_addr: String,
    #[serde(default, alias = "dstAddr", skip_serializing_if = "String::is_empty")]
    pub dst_addr: String,
    #[serde(default, alias = "dstPort", skip_serializing_if = "String::is_empty")]
    pub dst_port: String,
    #[serde(default)]
    pub action: String,
}

fn default_address() -> String {
    "0.0.0.0:9999".to_string()
}

fn default_max_buffer_size() -> usize {
    1600
}

fn default_tun_name() -> String {
    "uproxy".to_string()
}

fn default_mtu() -> u32 {
    1400
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    16
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_tcp_idle_timeout_secs() -> u64 {
    7200
}

fn default_udp_idle_timeout_secs() -> u64 {
    300
}

fn default_session_queue_capacity() -> usize {
    64
}

/// Serialized form of a policy list, as printed by `uproxy check`
#[derive(Debug, Serialize)]
pub struct PolicyList<'a> {
    pub policies: &'a [PolicyConfig],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.address, "0.0.0.0:9999");
        assert_eq!(config.max_buffer_size, 1600);
        assert!(config.tun.is_none());
        assert_eq!(config.engine.read_timeout(), Duration::from_secs(1));
        assert_eq!(config.engine.queue_capacity, 16);
        assert_eq!(config.proxy.udp_idle_timeout_secs, 300);
        assert!(config.policies.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config: Config = toml::from_str(
            r#"
            address = "127.0.0.1:5000"
            max_buffer_size = 9000

            [tun]
            address = "10.10.0.1/24"

            [engine]
            read_timeout_ms = 250

            [log]
            level = "debug"
            format = "json"

            [[policies]]
            dst_addr = "10.0.0.0/24"
            action = "local"

            [[policies]]
            srcAddr = "192.168.1.0/24"
            dstPort = "udp:53"
            action = "drop"
            "#,
        )
        .unwrap();

        assert_eq!(config.address, "127.0.0.1:5000");
        assert_eq!(config.max_buffer_size, 9000);
        let tun = config.tun.unwrap();
        assert_eq!(tun.name, "uproxy");
        assert_eq!(tun.mtu, 1400);
        assert_eq!(tun.address.as_deref(), Some("10.10.0.1/24"));
        assert_eq!(config.engine.read_timeout_ms, 250);
        assert_eq!(config.engine.queue_capacity, 16);
        assert_eq!(config.log.unwrap().format, "json");

        assert_eq!(config.policies.len(), 2);
        assert_eq!(config.policies[0].dst_addr, "10.0.0.0/24");
        assert_eq!(config.policies[1].src_addr, "192.168.1.0/24");
        assert_eq!(config.policies[1].dst_port, "udp:53");
        assert_eq!(config.policies[1].action, "drop");
    }

    #[test]
    fn test_tun_address() {
        let mut tun = TunConfig::default();
        assert_eq!(tun.parse_address().unwrap(), None);

        tun.address = Some("10.10.0.1/24".into());
        assert_eq!(
            tun.parse_address().unwrap(),
            Some((Ipv4Addr::new(10, 10, 0, 1), 24))
        );

        for bad in ["10.10.0.1", "10.10.0.1/33", "fd00::1/64", "x/8"] {
            tun.address = Some(bad.into());
            assert!(tun.parse_address().is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_policy_list_serializes_set_fields_only() {
        let policies = vec![PolicyConfig {
            dst_addr: "10.0.0.0/24".into(),
            action: "local".into(),
            ..Default::default()
        }];
        let text = toml::to_string(&PolicyList {
            policies: &policies,
        })
        .unwrap();
        assert!(text.contains("[[policies]]"));
        assert!(text.contains("dst_addr = \"10.0.0.0/24\""));
        assert!(!text.contains("src_addr"));

        #[derive(Deserialize)]
        struct Back {
            policies: Vec<PolicyConfig>,
        }
        let back: Back = toml::from_str(&text).unwrap();
        assert_eq!(back.policies, policies);
    }
}

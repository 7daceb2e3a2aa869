//! Packet I/O devices
//!
//! Every backend the engine forwards between implements [`Device`]:
//! - TUN: the local virtual interface
//! - UDP tunnel: IP packets carried in UDP datagrams
//! - Sink: discards everything written to it
//! - Proxy: relays flows through the connection tracker

mod proxy;
mod sink;
mod tun;
mod udp;

pub use proxy::ProxyDevice;
pub use sink::SinkDevice;
pub use tun::{TunDevice, TunSettings};
pub use udp::UdpTunnel;

use crate::packet::Packet;
use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::time::Instant;

/// Role a device plays in forwarding; policy actions resolve to one of these
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Sink for the drop action
    Drop,
    /// UDP tunnel for the route action
    Tunnel,
    /// Local TUN interface
    Local,
    /// Stateful proxy
    Proxy,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Drop => "drop",
            DeviceKind::Tunnel => "tunnel",
            DeviceKind::Local => "local",
            DeviceKind::Proxy => "proxy",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packet I/O backend
///
/// `read` and `write` must return by `deadline`. A read that times out
/// returns `Ok(0)`; the caller polls again.
#[async_trait]
pub trait Device: Send + Sync {
    /// Acquire backend resources.
    async fn start(&self) -> Result<()>;

    /// Release backend resources. Safe to call more than once, and after a
    /// failed start.
    async fn stop(&self) -> Result<()>;

    /// Human-readable name including the backend scheme
    fn name(&self) -> &str;

    fn kind(&self) -> DeviceKind;

    /// Whether the engine should schedule a reader for this device
    fn readable(&self) -> bool {
        true
    }

    /// Receive one packet into `pkt`'s buffer.
    async fn read(&self, pkt: &mut Packet, deadline: Instant) -> Result<usize>;

    /// Send one packet.
    async fn write(&self, pkt: &Packet, deadline: Instant) -> Result<usize>;
}

/// Device lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    Unstarted = 0,
    /// A `start` call owns the device and is acquiring resources
    Starting = 1,
    Running = 2,
    Stopped = 3,
}

impl DeviceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DeviceState::Starting,
            2 => DeviceState::Running,
            3 => DeviceState::Stopped,
            _ => DeviceState::Unstarted,
        }
    }
}

/// Atomic lifecycle shared by device implementations.
///
/// `begin_start` claims the device with a single compare-exchange, so of
/// two concurrent `start` calls exactly one acquires resources.
#[derive(Debug)]
pub struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub fn new() -> Self {
        Self(AtomicU8::new(DeviceState::Unstarted as u8))
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Claim the device for starting (Unstarted -> Starting).
    pub fn begin_start(&self, name: &str) -> Result<()> {
        match self.0.compare_exchange(
            DeviceState::Unstarted as u8,
            DeviceState::Starting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(current) => match DeviceState::from_u8(current) {
                DeviceState::Stopped => Err(Error::Device {
                    name: name.to_string(),
                    reason: "cannot restart a stopped device".into(),
                }),
                _ => Err(Error::AlreadyStarted {
                    name: name.to_string(),
                }),
            },
        }
    }

    /// Finish a start (Starting -> Running). Returns false if the device was
    /// stopped meanwhile; the caller then releases what it acquired.
    pub fn set_running(&self) -> bool {
        self.0
            .compare_exchange(
                DeviceState::Starting as u8,
                DeviceState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Give up a failed start (Starting -> Unstarted).
    pub fn abort_start(&self) {
        let _ = self.0.compare_exchange(
            DeviceState::Starting as u8,
            DeviceState::Unstarted as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Transition to Stopped. Returns false if it was already stopped.
    pub fn begin_stop(&self) -> bool {
        self.0.swap(DeviceState::Stopped as u8, Ordering::AcqRel) != DeviceState::Stopped as u8
    }

    pub fn ensure_running(&self, name: &str) -> Result<()> {
        if self.state() == DeviceState::Running {
            Ok(())
        } else {
            Err(Error::NotRunning {
                name: name.to_string(),
            })
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

//! Proxy device
//!
//! Terminates TCP/UDP flows locally and relays their payloads over real
//! sockets, one session per 5-tuple.

use super::{Device, DeviceKind, Lifecycle};
use crate::dataplane::ConnectionTracker;
use crate::packet::Packet;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

pub struct ProxyDevice {
    name: String,
    lifecycle: Lifecycle,
    tracker: Arc<ConnectionTracker>,
}

impl ProxyDevice {
    pub fn new(tracker: Arc<ConnectionTracker>) -> Self {
        Self {
            name: "proxy://conntrack".to_string(),
            lifecycle: Lifecycle::new(),
            tracker,
        }
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }
}

#[async_trait]
impl Device for ProxyDevice {
    async fn start(&self) -> Result<()> {
        self.lifecycle.begin_start(&self.name)?;
        if !self.lifecycle.set_running() {
            return Err(Error::NotRunning {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.lifecycle.begin_stop() {
            debug!("Stopping {} ({} flows)", self.name, self.tracker.len());
            self.tracker.shutdown();
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Proxy
    }

    // Replies from proxied peers are consumed by their sessions
    fn readable(&self) -> bool {
        false
    }

    async fn read(&self, _pkt: &mut Packet, _deadline: Instant) -> Result<usize> {
        Err(Error::NotReadable {
            name: self.name.clone(),
        })
    }

    async fn write(&self, pkt: &Packet, _deadline: Instant) -> Result<usize> {
        self.lifecycle.ensure_running(&self.name)?;
        if pkt.transport().is_none() {
            return Err(Error::UnsupportedProtocol(pkt.protocol()));
        }
        self.tracker.forward(pkt)
    }
}

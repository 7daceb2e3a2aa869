//! Black-hole device for the drop action

use super::{Device, DeviceKind, Lifecycle};
use crate::packet::Packet;
use crate::telemetry::Counter;
use crate::{Error, Result};
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::trace;

/// Discards every packet written to it
#[derive(Debug)]
pub struct SinkDevice {
    name: String,
    lifecycle: Lifecycle,
    dropped: Counter,
}

impl SinkDevice {
    pub fn new() -> Self {
        Self {
            name: "sink://drop".to_string(),
            lifecycle: Lifecycle::new(),
            dropped: Counter::new(),
        }
    }

    /// Number of packets discarded so far
    pub fn dropped(&self) -> u64 {
        self.dropped.get()
    }
}

impl Default for SinkDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Device for SinkDevice {
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
        self.lifecycle.begin_stop();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Drop
    }

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
        self.dropped.inc();
        trace!("Discarded {}", pkt);
        Ok(pkt.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_sink_counts_writes() {
        let sink = SinkDevice::new();
        sink.start().await.unwrap();

        let data = build::udp4(
            (Ipv4Addr::new(10, 0, 0, 1), 5353),
            (Ipv4Addr::new(10, 0, 0, 2), 53),
            b"q",
        );
        let pkt = Packet::from_bytes(&data).unwrap();
        let deadline = Instant::now();
        assert_eq!(sink.write(&pkt, deadline).await.unwrap(), data.len());
        assert_eq!(sink.write(&pkt, deadline).await.unwrap(), data.len());
        assert_eq!(sink.dropped(), 2);
    }

    #[tokio::test]
    async fn test_sink_is_not_readable() {
        let sink = SinkDevice::new();
        sink.start().await.unwrap();
        assert!(!sink.readable());

        let mut pkt = Packet::with_capacity(64);
        assert!(matches!(
            sink.read(&mut pkt, Instant::now()).await,
            Err(Error::NotReadable { .. })
        ));
    }

    #[tokio::test]
    async fn test_sink_stop_twice() {
        let sink = SinkDevice::new();
        sink.start().await.unwrap();
        assert!(sink.stop().await.is_ok());
        assert!(sink.stop().await.is_ok());

        let pkt = Packet::with_capacity(20);
        assert!(matches!(
            sink.write(&pkt, Instant::now()).await,
            Err(Error::NotRunning { .. })
        ));
    }
}

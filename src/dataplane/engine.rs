//! Forwarding engine
//!
//! Owns the registered devices and moves packets between them:
//! - one reader pipeline per readable device (read, parse, classify, hand off)
//! - one bounded egress queue and writer task per device
//!
//! Every task watches the shared cancellation token and returns within one
//! read timeout of it firing. Packets move by value from the reader into the
//! target queue and back into the pool once written or dropped.

use super::conntrack::{ConnectionTracker, FlowTimeouts};
use super::policy::PolicyTable;
use crate::config::{Config, PolicyConfig};
use crate::device::{
    Device, DeviceKind, ProxyDevice, SinkDevice, TunDevice, TunSettings, UdpTunnel,
};
use crate::packet::{Packet, PacketPool};
use crate::telemetry::{DeviceStats, MetricsRegistry};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Pause after a failed read before polling the device again
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Deadline for each read, write and queue hand-off
    pub read_timeout: Duration,
    /// Egress queue depth per device
    pub queue_capacity: usize,
    /// Packet buffer size
    pub max_buffer_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            queue_capacity: 16,
            max_buffer_size: 1600,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            read_timeout: config.engine.read_timeout(),
            queue_capacity: config.engine.queue_capacity.max(1),
            max_buffer_size: config.max_buffer_size,
        }
    }
}

pub struct Engine {
    settings: EngineSettings,
    policies: Vec<PolicyConfig>,
    devices: Vec<Arc<dyn Device>>,
    cancel: CancellationToken,
    metrics: Arc<MetricsRegistry>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        policies: Vec<PolicyConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            policies,
            devices: Vec::new(),
            cancel,
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    /// Build an engine with the devices a configuration describes: the
    /// sink, the UDP tunnel, the TUN interface when `[tun]` is present and
    /// the proxy.
    pub fn from_config(config: &Config, cancel: CancellationToken) -> Result<Self> {
        let mut engine = Self::new(
            EngineSettings::from_config(config),
            config.policies.clone(),
            cancel,
        );

        engine.register(Arc::new(SinkDevice::new()))?;
        engine.register(Arc::new(UdpTunnel::new(config.address.clone())))?;

        if let Some(tun) = &config.tun {
            engine.register(Arc::new(TunDevice::new(TunSettings {
                name: tun.name.clone(),
                address: tun.parse_address()?,
                mtu: tun.mtu,
            })))?;
        }

        let timeouts = FlowTimeouts {
            connect: Duration::from_millis(config.proxy.connect_timeout_ms),
            tcp_idle: Duration::from_secs(config.proxy.tcp_idle_timeout_secs),
            udp_idle: Duration::from_secs(config.proxy.udp_idle_timeout_secs),
        };
        let tracker = ConnectionTracker::new(
            timeouts,
            config.proxy.queue_capacity,
            engine.cancel.child_token(),
            engine.metrics(),
        );
        engine.register(Arc::new(ProxyDevice::new(tracker)))?;

        Ok(engine)
    }

    /// Add a device. At most one device per kind.
    pub fn register(&mut self, device: Arc<dyn Device>) -> Result<()> {
        let kind = device.kind();
        if self.devices.iter().any(|d| d.kind() == kind) {
            return Err(Error::DuplicateDevice {
                kind: kind.to_string(),
            });
        }
        debug!("Registered {} as {}", device.name(), kind);
        self.devices.push(device);
        Ok(())
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start every device and forward until cancelled.
    ///
    /// Only a device failing to start is an error; everything after that is
    /// logged and counted per packet.
    pub async fn run(self) -> Result<()> {
        let Engine {
            settings,
            policies,
            devices,
            cancel,
            metrics,
        } = self;

        let kinds: Vec<DeviceKind> = devices.iter().map(|d| d.kind()).collect();
        let configured = policies.len();
        // Route targets may be host names; resolve them on the blocking pool
        let table = tokio::task::spawn_blocking(move || PolicyTable::build(&policies, &kinds))
            .await
            .map_err(|e| Error::Policy(format!("failed to build policy table: {}", e)))?;
        let table = Arc::new(table);
        info!("Loaded {} of {} policies", table.len(), configured);
        if table.is_empty() {
            warn!("No usable policies, every packet will be dropped");
        }

        for (index, device) in devices.iter().enumerate() {
            if let Err(e) = device.start().await {
                error!("Failed to start {}: {}", device.name(), e);
                for started in devices[..=index].iter().rev() {
                    if let Err(stop_err) = started.stop().await {
                        warn!("Failed to stop {}: {}", started.name(), stop_err);
                    }
                }
                return Err(e);
            }
            info!("Started {}", device.name());
        }

        let pool = Arc::new(PacketPool::new(
            settings.max_buffer_size,
            settings.queue_capacity * devices.len().max(1),
        ));
        let mut tasks = JoinSet::new();

        let mut egress = HashMap::new();
        for device in &devices {
            let (tx, rx) = mpsc::channel(settings.queue_capacity);
            let stats = metrics.device(device.name());
            egress.insert(
                device.kind(),
                Egress {
                    tx,
                    stats: Arc::clone(&stats),
                    name: device.name().to_string(),
                },
            );
            tasks.spawn(
                Writer {
                    device: Arc::clone(device),
                    stats,
                    pool: Arc::clone(&pool),
                    write_timeout: settings.read_timeout,
                    cancel: cancel.clone(),
                }
                .run(rx),
            );
        }
        let egress = Arc::new(egress);

        for device in devices.iter().filter(|d| d.readable()) {
            tasks.spawn(
                Reader {
                    device: Arc::clone(device),
                    stats: metrics.device(device.name()),
                    table: Arc::clone(&table),
                    egress: Arc::clone(&egress),
                    pool: Arc::clone(&pool),
                    metrics: Arc::clone(&metrics),
                    read_timeout: settings.read_timeout,
                    cancel: cancel.clone(),
                }
                .run(),
            );
        }
        info!("Engine running with {} devices", devices.len());

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Pipeline task failed: {}", e);
                cancel.cancel();
            }
        }
        drop(egress);

        info!("Shutting down");
        for device in &devices {
            if let Err(e) = device.stop().await {
                warn!("Failed to stop {}: {}", device.name(), e);
            }
        }

        for (name, value) in metrics.export() {
            info!("{} = {}", name, value);
        }
        Ok(())
    }
}

/// Sending side of a device's egress queue
struct Egress {
    tx: mpsc::Sender<Packet>,
    stats: Arc<DeviceStats>,
    name: String,
}

struct Reader {
    device: Arc<dyn Device>,
    stats: Arc<DeviceStats>,
    table: Arc<PolicyTable>,
    egress: Arc<HashMap<DeviceKind, Egress>>,
    pool: Arc<PacketPool>,
    metrics: Arc<MetricsRegistry>,
    read_timeout: Duration,
    cancel: CancellationToken,
}

impl Reader {
    async fn run(self) {
        debug!("Reading from {}", self.device.name());
        while !self.cancel.is_cancelled() {
            let mut pkt = self.pool.get();
            let deadline = Instant::now() + self.read_timeout;
            let read = tokio::select! {
                _ = self.cancel.cancelled() => None,
                result = self.device.read(&mut pkt, deadline) => Some(result),
            };

            match read {
                None => {
                    self.pool.put(pkt);
                    break;
                }
                Some(Ok(0)) => self.pool.put(pkt),
                Some(Ok(len)) => {
                    self.stats.record_rx(len);
                    self.process(pkt, len).await;
                }
                Some(Err(e)) => {
                    self.pool.put(pkt);
                    self.stats.rx_errors.inc();
                    warn!("Read from {} failed: {}", self.device.name(), e);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        debug!("Reader for {} stopped", self.device.name());
    }

    async fn process(&self, mut pkt: Packet, len: usize) {
        if let Err(e) = pkt.parse(len) {
            self.metrics.parse_errors.inc();
            debug!("Dropping malformed packet from {}: {}", self.device.name(), e);
            self.drop_packet(pkt);
            return;
        }
        pkt.meta.source = Some(self.device.kind());

        let action = match self.table.evaluate(&pkt) {
            Some(rule) => rule.action,
            None => {
                self.metrics.policy_misses.inc();
                warn!("No policy for {}, dropping", pkt);
                self.drop_packet(pkt);
                return;
            }
        };

        let target = action.target();
        let Some(egress) = self.egress.get(&target) else {
            warn!("No {} device for {}, dropping", target, pkt);
            self.drop_packet(pkt);
            return;
        };
        if let Some(endpoint) = action.endpoint() {
            pkt.meta.endpoint = Some(endpoint);
        }
        trace!("{} -> {}", pkt, action);

        let reserved = tokio::select! {
            _ = self.cancel.cancelled() => None,
            permit = tokio::time::timeout(self.read_timeout, egress.tx.reserve()) => Some(permit),
        };
        match reserved {
            Some(Ok(Ok(permit))) => {
                permit.send(pkt);
                self.metrics.packets_forwarded.inc();
            }
            Some(Err(_elapsed)) => {
                self.metrics.queue_full.inc();
                egress.stats.tx_drops.inc();
                warn!("Queue for {} full, dropping {}", egress.name, pkt);
                self.drop_packet(pkt);
            }
            // Writer gone or shutting down
            Some(Ok(Err(_))) | None => self.drop_packet(pkt),
        }
    }

    fn drop_packet(&self, pkt: Packet) {
        self.metrics.packets_dropped.inc();
        self.pool.put(pkt);
    }
}

struct Writer {
    device: Arc<dyn Device>,
    stats: Arc<DeviceStats>,
    pool: Arc<PacketPool>,
    write_timeout: Duration,
    cancel: CancellationToken,
}

impl Writer {
    async fn run(self, mut rx: mpsc::Receiver<Packet>) {
        loop {
            let pkt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                pkt = rx.recv() => match pkt {
                    Some(pkt) => pkt,
                    None => break,
                },
            };

            let deadline = Instant::now() + self.write_timeout;
            match self.device.write(&pkt, deadline).await {
                Ok(written) if written == pkt.len() => self.stats.record_tx(written),
                Ok(written) => {
                    self.stats.tx_errors.inc();
                    let e = Error::ShortWrite {
                        device: self.device.name().to_string(),
                        written,
                        expected: pkt.len(),
                    };
                    warn!("{}", e);
                }
                Err(e) => {
                    self.stats.tx_errors.inc();
                    warn!("Write of {} to {} failed: {}", pkt, self.device.name(), e);
                }
            }
            self.pool.put(pkt);
        }

        rx.close();
        while let Ok(pkt) = rx.try_recv() {
            self.pool.put(pkt);
        }
        debug!("Writer for {} stopped", self.device.name());
    }
}

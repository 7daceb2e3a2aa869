//! Metrics collection for forwarding statistics.
//!
//! Thread-safe counters at the global level and per device. Pipelines hold
//! an `Arc<DeviceStats>` for their device so the hot path never touches the
//! registry map.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-device statistics.
#[derive(Debug, Default)]
pub struct DeviceStats {
    /// Packets read from the device.
    pub rx_packets: Counter,
    pub rx_bytes: Counter,
    /// Packets written to the device.
    pub tx_packets: Counter,
    pub tx_bytes: Counter,
    /// Failed reads.
    pub rx_errors: Counter,
    /// Failed or short writes.
    pub tx_errors: Counter,
    /// Packets for this device dropped before the write (queue full).
    pub tx_drops: Counter,
}

impl DeviceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.inc();
        self.rx_bytes.add(bytes as u64);
    }

    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.inc();
        self.tx_bytes.add(bytes as u64);
    }
}

/// Global metrics registry for the engine.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    devices: RwLock<BTreeMap<String, Arc<DeviceStats>>>,

    // Forwarding
    /// Packets handed to a target device's queue.
    pub packets_forwarded: Counter,
    /// Packets discarded for any reason other than a drop action.
    pub packets_dropped: Counter,
    /// Packets that failed to parse.
    pub parse_errors: Counter,
    /// Packets no policy matched.
    pub policy_misses: Counter,
    /// Hand-offs abandoned because the target queue stayed full.
    pub queue_full: Counter,

    // Proxy
    pub flows_created: Counter,
    pub flows_closed: Counter,
    /// Outbound connects that failed or timed out.
    pub dial_failures: Counter,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stats for `device`, registering it on first use.
    pub fn device(&self, device: &str) -> Arc<DeviceStats> {
        if let Some(stats) = self
            .devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(device)
        {
            return Arc::clone(stats);
        }
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(devices.entry(device.to_string()).or_default())
    }

    /// Exports all metrics as key-value pairs.
    pub fn export(&self) -> Vec<(String, u64)> {
        let mut result = vec![
            ("packets_forwarded".into(), self.packets_forwarded.get()),
            ("packets_dropped".into(), self.packets_dropped.get()),
            ("parse_errors".into(), self.parse_errors.get()),
            ("policy_misses".into(), self.policy_misses.get()),
            ("queue_full".into(), self.queue_full.get()),
            ("flows_created".into(), self.flows_created.get()),
            ("flows_closed".into(), self.flows_closed.get()),
            ("dial_failures".into(), self.dial_failures.get()),
        ];

        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        for (name, stats) in devices.iter() {
            result.extend([
                (format!("{}_rx_packets", name), stats.rx_packets.get()),
                (format!("{}_rx_bytes", name), stats.rx_bytes.get()),
                (format!("{}_tx_packets", name), stats.tx_packets.get()),
                (format!("{}_tx_bytes", name), stats.tx_bytes.get()),
                (format!("{}_rx_errors", name), stats.rx_errors.get()),
                (format!("{}_tx_errors", name), stats.tx_errors.get()),
                (format!("{}_tx_drops", name), stats.tx_drops.get()),
            ]);
        }

        result
    }
}

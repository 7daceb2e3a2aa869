//! Packet buffer pool
//!
//! Pipelines take a packet before each read and hand it back once it has
//! been written or dropped, so steady-state forwarding does not allocate.

use super::Packet;
use std::sync::Mutex;

/// Pool of reusable packets of a fixed maximum size
#[derive(Debug)]
pub struct PacketPool {
    max_size: usize,
    max_idle: usize,
    free: Mutex<Vec<Packet>>,
}

impl PacketPool {
    /// Create a pool of `max_size`-byte packets keeping at most `max_idle` spares.
    pub fn new(max_size: usize, max_idle: usize) -> Self {
        Self {
            max_size,
            max_idle,
            free: Mutex::new(Vec::with_capacity(max_idle)),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Take a packet, allocating if no spare is available.
    pub fn get(&self) -> Packet {
        let spare = self.free.lock().ok().and_then(|mut free| free.pop());
        spare.unwrap_or_else(|| Packet::with_capacity(self.max_size))
    }

    /// Return a packet. Packets of a different size are discarded.
    pub fn put(&self, mut pkt: Packet) {
        if pkt.capacity() != self.max_size {
            return;
        }
        pkt.reset();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.max_idle {
                free.push(pkt);
            }
        }
    }

    /// Number of idle packets held
    pub fn idle(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build;
    use std::net::{Ipv4Addr, SocketAddr};

    #[test]
    fn test_get_allocates_max_size() {
        let pool = PacketPool::new(1600, 4);
        let pkt = pool.get();
        assert_eq!(pkt.capacity(), 1600);
        assert!(pkt.is_empty());
    }

    #[test]
    fn test_put_resets_and_recycles() {
        let pool = PacketPool::new(128, 4);
        let mut pkt = pool.get();
        let data = build::udp4(
            (Ipv4Addr::new(10, 0, 0, 1), 1),
            (Ipv4Addr::new(10, 0, 0, 2), 2),
            b"hi",
        );
        pkt.buffer_mut()[..data.len()].copy_from_slice(&data);
        pkt.parse(data.len()).unwrap();
        pkt.meta.endpoint = Some(SocketAddr::from(([203, 0, 113, 9], 4500)));

        pool.put(pkt);
        assert_eq!(pool.idle(), 1);

        let reused = pool.get();
        assert_eq!(pool.idle(), 0);
        assert!(reused.is_empty());
        assert!(!reused.is_parsed());
        assert_eq!(reused.meta.endpoint, None);
    }

    #[test]
    fn test_idle_limit() {
        let pool = PacketPool::new(64, 2);
        for _ in 0..5 {
            pool.put(Packet::with_capacity(64));
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_foreign_size_discarded() {
        let pool = PacketPool::new(64, 2);
        pool.put(Packet::with_capacity(32));
        assert_eq!(pool.idle(), 0);
    }
}

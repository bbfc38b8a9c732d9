//! Packet capture tap
//!
//! The worker hands a shared reference of every forwarded packet to a tap
//! ring; a diagnostics thread later drains the ring into a [`CaptureSink`].
//! While a reference sits on the tap, later stages see the buffer as shared
//! and cannot mutate it.

use crate::buffer::Mbuf;
use crate::error::DataplaneResult;
use crate::ring::Ring;
use std::sync::atomic::{AtomicU64, Ordering};

/// Offline recording sink
pub trait CaptureSink: Send {
    /// Record one packet
    fn write_packet(&mut self, pkt: &Mbuf) -> DataplaneResult<()>;
}

/// Lossy capture point between a worker and a sink
#[derive(Debug)]
pub struct CaptureTap {
    ring: Ring<Mbuf>,
    tapped: AtomicU64,
    dropped: AtomicU64,
}

impl CaptureTap {
    /// Hold up to `capacity` packets between drains
    pub fn new(name: impl Into<String>, capacity: usize) -> DataplaneResult<Self> {
        Ok(Self {
            ring: Ring::new(name, capacity)?,
            tapped: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Keep a reference to `pkt` if there is room; never waits
    #[inline]
    pub fn tap(&self, pkt: &Mbuf) -> bool {
        match self.ring.enqueue(pkt.clone_ref()) {
            Ok(()) => {
                self.tapped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_full) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Move up to `max` captured packets into `sink`
    pub fn drain_into(&self, sink: &mut dyn CaptureSink, max: usize) -> DataplaneResult<usize> {
        let mut batch = Vec::with_capacity(max.min(self.ring.capacity()));
        self.ring.dequeue_bulk(&mut batch, max);
        let n = batch.len();
        for pkt in &batch {
            sink.write_packet(pkt)?;
        }
        Ok(n)
    }

    /// Captured packets not yet drained
    pub fn pending(&self) -> usize {
        self.ring.count()
    }

    /// Packets captured so far
    pub fn tapped(&self) -> u64 {
        self.tapped.load(Ordering::Relaxed)
    }

    /// Packets skipped because the tap was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// One recorded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    pub port: u16,
    pub timestamp: u64,
    pub data: Vec<u8>,
}

/// Sink keeping copies in memory
#[derive(Debug, Default)]
pub struct MemoryCapture {
    packets: Vec<CapturedPacket>,
    limit: Option<usize>,
}

impl MemoryCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` packets, ignoring the rest
    pub fn with_limit(limit: usize) -> Self {
        Self { packets: Vec::new(), limit: Some(limit) }
    }

    pub fn packets(&self) -> &[CapturedPacket] {
        &self.packets
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

impl CaptureSink for MemoryCapture {
    fn write_packet(&mut self, pkt: &Mbuf) -> DataplaneResult<()> {
        if self.limit.is_some_and(|limit| self.packets.len() >= limit) {
            return Ok(());
        }
        self.packets.push(CapturedPacket {
            port: pkt.port(),
            timestamp: pkt.timestamp(),
            data: pkt.data().to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::config::PoolConfig;

    fn pool() -> BufferPool {
        BufferPool::new("capture", &PoolConfig { capacity: 16, ..Default::default() }).unwrap()
    }

    #[test]
    fn test_tap_and_drain() {
        let pool = pool();
        let tap = CaptureTap::new("tap", 4).unwrap();

        let mut pkt = pool.alloc().unwrap();
        pkt.copy_from_slice(b"hello");
        pkt.set_port(3);
        assert!(tap.tap(&pkt));
        assert_eq!(pkt.refcount(), 2);
        assert!(!pkt.is_exclusive());

        let mut sink = MemoryCapture::new();
        assert_eq!(tap.drain_into(&mut sink, 16).unwrap(), 1);
        assert_eq!(sink.packets()[0].data, b"hello");
        assert_eq!(sink.packets()[0].port, 3);
        assert_eq!(pkt.refcount(), 1);

        drop(pkt);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_full_tap_counts_drops() {
        let pool = pool();
        let tap = CaptureTap::new("tap", 2).unwrap();
        let pkts = pool.alloc_bulk(3).unwrap();
        let kept: Vec<bool> = pkts.iter().map(|p| tap.tap(p)).collect();
        assert_eq!(kept, vec![true, true, false]);
        assert_eq!(tap.dropped(), 1);
        assert_eq!(tap.tapped(), 2);
        assert_eq!(pkts[2].refcount(), 1);
    }

    #[test]
    fn test_memory_capture_limit() {
        let pool = pool();
        let tap = CaptureTap::new("tap", 8).unwrap();
        for pkt in pool.alloc_bulk(4).unwrap() {
            tap.tap(&pkt);
        }
        let mut sink = MemoryCapture::with_limit(2);
        assert_eq!(tap.drain_into(&mut sink, 8).unwrap(), 4);
        assert_eq!(sink.len(), 2);
        assert_eq!(tap.pending(), 0);
    }
}

//! Burst I/O ports
//!
//! A port is one (device, queue) pair. It moves batches of buffers between
//! the wire and its owner and is driven by exactly one thread: ports are
//! `Send` but never shared.

use crate::buffer::Mbuf;
use crate::error::{DataplaneResult, ErrorCode};
use std::fmt;

/// (device id, queue id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId {
    pub device: u16,
    pub queue: u16,
}

impl PortId {
    pub const fn new(device: u16, queue: u16) -> Self {
        Self { device, queue }
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device, self.queue)
    }
}

/// Per-queue settings passed to `open_port`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub queue: u16,
    pub rx_desc: usize,
    pub tx_desc: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { queue: 0, rx_desc: 512, tx_desc: 512 }
    }
}

/// One device queue pair
pub trait BurstPort: Send {
    /// Queue identity
    fn id(&self) -> PortId;

    /// Append up to `max_n` received buffers to `pkts`
    ///
    /// Never waits for more packets. Returns the number appended; the
    /// buffers now belong to the caller.
    fn rx_burst(&mut self, pkts: &mut Vec<Mbuf>, max_n: usize) -> usize;

    /// Submit `pkts` for transmission, front first
    ///
    /// Returns how many the queue accepted; those are removed from the
    /// front of `pkts`. Rejected buffers stay in `pkts`, owned by the
    /// caller. A short count is backpressure, not an error.
    fn tx_burst(&mut self, pkts: &mut Vec<Mbuf>) -> usize;
}

impl fmt::Debug for dyn BurstPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BurstPort({})", self.id())
    }
}

/// Device manager capability
pub trait DeviceManager: Send + Sync {
    /// Take ownership of one queue pair of `device`
    fn open_port(&self, device: u16, config: &QueueConfig) -> DataplaneResult<Box<dyn BurstPort>>;

    /// Give a queue pair back
    fn close_port(&self, port: Box<dyn BurstPort>) -> DataplaneResult<()>;

    /// Most recent error reported by `device`
    ///
    /// Reading does not clear it; compare [`error_count`](Self::error_count)
    /// between reads to tell whether anything new happened. Any number of
    /// workers may watch the same device.
    fn last_error_code(&self, device: u16) -> Option<ErrorCode>;

    /// Errors reported by `device` so far, monotonic
    fn error_count(&self, device: u16) -> u64;
}

//! Software device
//!
//! In-process [`DeviceManager`] whose queues are rings. `inject` plays the
//! part of the wire on the receive side, `drain_tx` on the transmit side.
//! Link state, transmit budgets and device errors can be driven from the
//! outside to exercise backpressure and error handling.

use crate::buffer::{BufferPool, Mbuf};
use crate::config::DeviceConfig;
use crate::error::{DataplaneError, DataplaneResult, ErrorCode};
use crate::port::{BurstPort, DeviceManager, PortId, QueueConfig};
use crate::ring::Ring;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

const UNLIMITED: usize = usize::MAX;

struct QueueRings {
    rx: Ring<Mbuf>,
    tx: Ring<Mbuf>,
}

struct VirtualQueue {
    rings: Mutex<Option<Arc<QueueRings>>>,
    tx_budget: AtomicUsize,
}

#[derive(Default)]
struct NicStats {
    rx_packets: AtomicU64,
    rx_missed: AtomicU64,
    rx_nombuf: AtomicU64,
    tx_packets: AtomicU64,
}

/// Counters of one software NIC
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NicStatsSnapshot {
    pub rx_packets: u64,
    pub rx_missed: u64,
    pub rx_nombuf: u64,
    pub tx_packets: u64,
}

struct VirtualNic {
    queues: Vec<VirtualQueue>,
    link_up: AtomicBool,
    last_error: Mutex<Option<ErrorCode>>,
    errors: AtomicU64,
    stats: NicStats,
}

impl VirtualNic {
    fn report(&self, code: ErrorCode) {
        *self.last_error.lock() = Some(code);
        self.errors.fetch_add(1, Ordering::Release);
    }
}

struct DeviceInner {
    pool: BufferPool,
    nics: Vec<VirtualNic>,
}

impl DeviceInner {
    fn nic(&self, device: u16) -> DataplaneResult<&VirtualNic> {
        self.nics.get(device as usize).ok_or(DataplaneError::Device {
            device,
            code: ErrorCode::NoSuchDevice,
        })
    }

    fn queue(&self, id: PortId) -> DataplaneResult<&VirtualQueue> {
        self.nic(id.device)?
            .queues
            .get(id.queue as usize)
            .ok_or(DataplaneError::Device { device: id.device, code: ErrorCode::NoSuchQueue })
    }

    fn rings(&self, id: PortId) -> DataplaneResult<Option<Arc<QueueRings>>> {
        Ok(self.queue(id)?.rings.lock().clone())
    }
}

/// Software device manager
#[derive(Clone)]
pub struct VirtualDevice {
    inner: Arc<DeviceInner>,
}

impl VirtualDevice {
    /// Create `config.ports` NICs whose receive side allocates from `pool`
    pub fn new(pool: BufferPool, config: &DeviceConfig) -> DataplaneResult<Self> {
        config.validate()?;
        let queue_pairs = config.rx_queues.max(config.tx_queues) as usize;
        let nics = (0..config.ports)
            .map(|_| VirtualNic {
                queues: (0..queue_pairs)
                    .map(|_| VirtualQueue {
                        rings: Mutex::new(None),
                        tx_budget: AtomicUsize::new(UNLIMITED),
                    })
                    .collect(),
                link_up: AtomicBool::new(true),
                last_error: Mutex::new(None),
                errors: AtomicU64::new(0),
                stats: NicStats::default(),
            })
            .collect();

        tracing::info!(ports = config.ports, queue_pairs, "virtual device created");
        Ok(Self { inner: Arc::new(DeviceInner { pool, nics }) })
    }

    /// Number of NICs
    pub fn port_count(&self) -> u16 {
        self.inner.nics.len() as u16
    }

    /// Pool receive buffers come from
    pub fn pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    /// Deliver one frame to the receive side of `id`
    ///
    /// Returns false when the frame was lost: queue not open, link down,
    /// no buffer, frame too large or receive ring full.
    pub fn inject(&self, id: PortId, frame: &[u8]) -> DataplaneResult<bool> {
        let nic = self.inner.nic(id.device)?;
        let Some(rings) = self.inner.rings(id)? else {
            nic.stats.rx_missed.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        };
        if !nic.link_up.load(Ordering::Acquire) {
            nic.stats.rx_missed.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        let mut mbuf = match self.inner.pool.alloc() {
            Ok(mbuf) => mbuf,
            Err(_) => {
                nic.stats.rx_nombuf.fetch_add(1, Ordering::Relaxed);
                nic.report(ErrorCode::NoMbuf);
                return Ok(false);
            }
        };
        if !mbuf.copy_from_slice(frame) {
            nic.stats.rx_missed.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        mbuf.set_port(id.device);

        match rings.rx.enqueue(mbuf) {
            Ok(()) => Ok(true),
            Err(_) => {
                nic.stats.rx_missed.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
        }
    }

    /// Take up to `max_n` transmitted frames off the wire of `id`
    pub fn drain_tx(&self, id: PortId, out: &mut Vec<Mbuf>, max_n: usize) -> DataplaneResult<usize> {
        Ok(match self.inner.rings(id)? {
            Some(rings) => rings.tx.dequeue_bulk(out, max_n).count,
            None => 0,
        })
    }

    /// Accept at most `budget` more packets on `id`, `None` for unlimited
    pub fn set_tx_budget(&self, id: PortId, budget: Option<usize>) -> DataplaneResult<()> {
        self.inner
            .queue(id)?
            .tx_budget
            .store(budget.unwrap_or(UNLIMITED), Ordering::Release);
        Ok(())
    }

    /// Bring the link of `device` up or down
    pub fn set_link(&self, device: u16, up: bool) -> DataplaneResult<()> {
        let nic = self.inner.nic(device)?;
        nic.link_up.store(up, Ordering::Release);
        if !up {
            nic.report(ErrorCode::LinkDown);
        }
        tracing::info!(device, up, "link state changed");
        Ok(())
    }

    /// Record an error on `device`, as a driver would
    pub fn raise_error(&self, device: u16, code: ErrorCode) -> DataplaneResult<()> {
        self.inner.nic(device)?.report(code);
        Ok(())
    }

    /// Counters of `device`
    pub fn stats(&self, device: u16) -> DataplaneResult<NicStatsSnapshot> {
        let stats = &self.inner.nic(device)?.stats;
        Ok(NicStatsSnapshot {
            rx_packets: stats.rx_packets.load(Ordering::Relaxed),
            rx_missed: stats.rx_missed.load(Ordering::Relaxed),
            rx_nombuf: stats.rx_nombuf.load(Ordering::Relaxed),
            tx_packets: stats.tx_packets.load(Ordering::Relaxed),
        })
    }
}

impl DeviceManager for VirtualDevice {
    fn open_port(&self, device: u16, config: &QueueConfig) -> DataplaneResult<Box<dyn BurstPort>> {
        let id = PortId::new(device, config.queue);
        let queue = self.inner.queue(id)?;

        let mut slot = queue.rings.lock();
        if slot.is_some() {
            return Err(DataplaneError::Device { device, code: ErrorCode::QueueInUse });
        }
        let rings = Arc::new(QueueRings {
            rx: Ring::new(format!("vdev{}-rx{}", device, config.queue), config.rx_desc)?,
            tx: Ring::new(format!("vdev{}-tx{}", device, config.queue), config.tx_desc)?,
        });
        *slot = Some(Arc::clone(&rings));

        tracing::debug!(port = %id, rx_desc = config.rx_desc, tx_desc = config.tx_desc, "port opened");
        Ok(Box::new(VirtualPort { device: Arc::clone(&self.inner), id, rings }))
    }

    fn close_port(&self, port: Box<dyn BurstPort>) -> DataplaneResult<()> {
        let id = port.id();
        self.inner.queue(id)?;
        drop(port);
        tracing::debug!(port = %id, "port closed");
        Ok(())
    }

    fn last_error_code(&self, device: u16) -> Option<ErrorCode> {
        match self.inner.nic(device) {
            Ok(nic) => *nic.last_error.lock(),
            Err(_) => Some(ErrorCode::NoSuchDevice),
        }
    }

    fn error_count(&self, device: u16) -> u64 {
        self.inner
            .nic(device)
            .map(|nic| nic.errors.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

/// Queue pair handle of a [`VirtualDevice`]
pub struct VirtualPort {
    device: Arc<DeviceInner>,
    id: PortId,
    rings: Arc<QueueRings>,
}

impl VirtualPort {
    fn nic(&self) -> &VirtualNic {
        &self.device.nics[self.id.device as usize]
    }

    fn queue(&self) -> &VirtualQueue {
        &self.nic().queues[self.id.queue as usize]
    }
}

impl BurstPort for VirtualPort {
    fn id(&self) -> PortId {
        self.id
    }

    fn rx_burst(&mut self, pkts: &mut Vec<Mbuf>, max_n: usize) -> usize {
        let nic = self.nic();
        if !nic.link_up.load(Ordering::Acquire) {
            return 0;
        }
        let n = self.rings.rx.dequeue_bulk(pkts, max_n).count;
        nic.stats.rx_packets.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    fn tx_burst(&mut self, pkts: &mut Vec<Mbuf>) -> usize {
        let nic = self.nic();
        if pkts.is_empty() {
            return 0;
        }
        if !nic.link_up.load(Ordering::Acquire) {
            nic.report(ErrorCode::LinkDown);
            return 0;
        }

        let budget = self.queue().tx_budget.load(Ordering::Acquire);
        let sent = if budget >= pkts.len() {
            self.rings.tx.enqueue_bulk(pkts)
        } else {
            let mut head: Vec<Mbuf> = pkts.drain(..budget).collect();
            let sent = self.rings.tx.enqueue_bulk(&mut head);
            pkts.splice(0..0, head);
            sent
        };

        if budget != UNLIMITED {
            self.queue().tx_budget.fetch_sub(sent, Ordering::AcqRel);
        }
        nic.stats.tx_packets.fetch_add(sent as u64, Ordering::Relaxed);
        sent
    }
}

impl Drop for VirtualPort {
    fn drop(&mut self) {
        let mut slot = self.queue().rings.lock();
        if slot.as_ref().is_some_and(|r| Arc::ptr_eq(r, &self.rings)) {
            *slot = None;
        }
    }
}

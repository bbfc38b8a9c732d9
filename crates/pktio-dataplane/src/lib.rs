//! pktio data plane
//!
//! Lock-free packet I/O core: buffers move between a pool, MPMC rings and
//! burst ports, driven by one worker per core.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         PKTIO DATA PLANE                         │
//! │                                                                  │
//! │   NIC ──► BurstPort (RX) ──► Ring ──► Worker ──► Ring ──► ...    │
//! │                                         │                        │
//! │                                         ▼                        │
//! │                                  PacketProcessor                 │
//! │                                         │                        │
//! │   NIC ◄── BurstPort (TX) ◄── TxBuffer ◄─┘                        │
//! │                                                                  │
//! │   ┌──────────────────┐                                           │
//! │   │    BufferPool    │  every Mbuf is allocated here and         │
//! │   │ free: Ring<u32>  │  returns here when its last handle drops  │
//! │   └──────────────────┘                                           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Ownership
//!
//! 1. **Move-only buffers**: an [`Mbuf`] has exactly one owner; handing it
//!    to a ring or port moves it
//! 2. **Lock-free transport**: rings and the pool free list use CAS cursors
//! 3. **Single-owner ports**: a device queue is driven by one worker
//! 4. **Burst everything**: up to [`BURST_SIZE`] packets per call
//!
//! Ordering on a ring is per producer only; concurrent producers interleave.

pub mod buffer;
pub mod capture;
pub mod clock;
pub mod config;
pub mod cores;
pub mod engine;
pub mod error;
pub mod memory;
pub mod pacer;
pub mod port;
pub mod ring;
pub mod stats;
pub mod txbuf;
pub mod virtual_dev;
pub mod worker;

pub use buffer::{BufferPool, Mbuf, RawMbuf};
pub use capture::{CaptureSink, CaptureTap, MemoryCapture};
pub use clock::{Affinity, Clock, FakeClock, NoAffinity, SystemAffinity, TscClock};
pub use config::{BackpressurePolicy, DataplaneConfig, DeviceConfig, PoolConfig, WorkerConfig};
pub use cores::{CoreHandle, CoreManager, CorePreference};
pub use engine::Engine;
pub use error::{DataplaneError, DataplaneResult, ErrorCode, Full};
pub use memory::{HeapAllocator, MemoryRegion, RegionAllocator};
pub use port::{BurstPort, DeviceManager, PortId, QueueConfig};
pub use ring::Ring;
pub use stats::{AggregateStats, CoreStats, CoreStatsSnapshot};
pub use txbuf::TxBuffer;
pub use virtual_dev::VirtualDevice;
pub use worker::{Input, Output, PacketProcessor, Verdict, Worker, WorkerContext, WorkerHandle, WorkerState};

/// Packets moved per burst
pub const BURST_SIZE: usize = 32;

/// Cache line size used for padding and region alignment
pub const CACHE_LINE: usize = 64;

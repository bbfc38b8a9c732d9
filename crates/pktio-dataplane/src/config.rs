//! Data plane configuration
//!
//! JSON on disk, with defaults suitable for a small software deployment.

use crate::buffer::{DEFAULT_DATA_ROOM, DEFAULT_HEADROOM};
use crate::error::{DataplaneError, DataplaneResult};
use crate::ring::MAX_RING_CAPACITY;
use crate::BURST_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete data plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataplaneConfig {
    /// Packet buffer pool
    pub pool: PoolConfig,
    /// Slots in each inter-stage ring
    pub ring_capacity: usize,
    /// Device layout
    pub device: DeviceConfig,
    /// Worker loop tuning
    pub worker: WorkerConfig,
    /// Number of processing workers between the RX and TX stages
    pub workers: usize,
    /// Pin worker threads to their assigned cores
    pub pin_cores: bool,
    /// Give every worker a core of its own
    pub dedicated_cores: bool,
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            ring_capacity: 16384,
            device: DeviceConfig::default(),
            worker: WorkerConfig::default(),
            workers: 1,
            pin_cores: false,
            dedicated_cores: false,
        }
    }
}

impl DataplaneConfig {
    /// Load from file
    pub fn load(path: impl AsRef<Path>) -> DataplaneResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to file
    pub fn save(&self, path: impl AsRef<Path>) -> DataplaneResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> DataplaneResult<()> {
        self.pool.validate()?;
        self.device.validate()?;
        self.worker.validate()?;
        if !self.ring_capacity.is_power_of_two() || self.ring_capacity > MAX_RING_CAPACITY {
            return Err(DataplaneError::Config(format!(
                "ring_capacity {} must be a power of two up to {}",
                self.ring_capacity, MAX_RING_CAPACITY
            )));
        }
        if self.workers == 0 {
            return Err(DataplaneError::Config("workers must be at least 1".into()));
        }
        Ok(())
    }
}

/// Buffer pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of buffers
    pub capacity: usize,
    /// Bytes of packet storage per buffer, headroom included
    pub data_room: usize,
    /// Bytes reserved in front of the packet on allocation
    pub headroom: usize,
    /// Preferred NUMA node for the backing region
    pub numa_node: Option<u32>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 8191,
            data_room: DEFAULT_DATA_ROOM,
            headroom: DEFAULT_HEADROOM,
            numa_node: None,
        }
    }
}

impl PoolConfig {
    /// Check pool constraints
    pub fn validate(&self) -> DataplaneResult<()> {
        if self.capacity == 0 || self.capacity > u32::MAX as usize {
            return Err(DataplaneError::Config(format!(
                "pool capacity {} out of range",
                self.capacity
            )));
        }
        if self.data_room == 0 || self.data_room > u16::MAX as usize {
            return Err(DataplaneError::Config(format!(
                "data_room {} out of range",
                self.data_room
            )));
        }
        if self.headroom >= self.data_room {
            return Err(DataplaneError::Config(format!(
                "headroom {} does not fit in data_room {}",
                self.headroom, self.data_room
            )));
        }
        Ok(())
    }
}

/// Device layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Number of ports (devices)
    pub ports: u16,
    /// RX queues per port
    pub rx_queues: u16,
    /// TX queues per port
    pub tx_queues: u16,
    /// RX descriptors per queue
    pub rx_desc: usize,
    /// TX descriptors per queue
    pub tx_desc: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ports: 2,
            rx_queues: 1,
            tx_queues: 1,
            rx_desc: 512,
            tx_desc: 512,
        }
    }
}

impl DeviceConfig {
    /// Check device constraints
    pub fn validate(&self) -> DataplaneResult<()> {
        if self.ports == 0 || self.rx_queues == 0 || self.tx_queues == 0 {
            return Err(DataplaneError::Config("device needs at least one port and queue".into()));
        }
        for (what, n) in [("rx_desc", self.rx_desc), ("tx_desc", self.tx_desc)] {
            if !n.is_power_of_two() {
                return Err(DataplaneError::Config(format!("{} {} is not a power of two", what, n)));
            }
        }
        Ok(())
    }
}

/// What to do with packets an output did not accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Free and count them right away
    Drop,
    /// Keep them for up to `max_attempts` further flushes, then drop
    Retry { max_attempts: u32 },
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::Retry { max_attempts: 4 }
    }
}

/// Worker loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Packets pulled per burst
    pub burst_size: usize,
    /// Packet rate limit per worker, `None` for unpaced
    pub rate_pps: Option<u64>,
    /// Handling of rejected output
    pub backpressure: BackpressurePolicy,
    /// Flush attempts while draining before leftovers are dropped
    pub drain_attempts: u32,
    /// Consecutive device-error cycles before an alarm is raised
    pub alarm_threshold: u32,
    /// Metrics flush interval
    pub stats_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            burst_size: BURST_SIZE,
            rate_pps: None,
            backpressure: BackpressurePolicy::default(),
            drain_attempts: 16,
            alarm_threshold: 8,
            stats_interval_ms: 1000,
        }
    }
}

impl WorkerConfig {
    /// Check worker constraints
    pub fn validate(&self) -> DataplaneResult<()> {
        if self.burst_size == 0 {
            return Err(DataplaneError::Config("burst_size must be at least 1".into()));
        }
        if self.rate_pps == Some(0) {
            return Err(DataplaneError::Config("rate_pps must be positive when set".into()));
        }
        if self.alarm_threshold == 0 {
            return Err(DataplaneError::Config("alarm_threshold must be at least 1".into()));
        }
        Ok(())
    }
}

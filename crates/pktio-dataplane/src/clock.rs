//! Cycle clock and CPU affinity capabilities
//!
//! Workers measure time in clock cycles and pin themselves through these
//! traits, so tests can drive them with a fake clock and no real pinning.

use crate::error::{DataplaneError, DataplaneResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic cycle counter
pub trait Clock: Send + Sync {
    /// Current cycle count
    fn cycles(&self) -> u64;

    /// Cycles per second, for converting to wall time
    fn cycles_per_second(&self) -> u64;

    /// Convert a duration to cycles
    fn cycles_for(&self, duration: Duration) -> u64 {
        (duration.as_nanos() * self.cycles_per_second() as u128 / 1_000_000_000) as u64
    }
}

/// Time-stamp counter clock
///
/// Reads the TSC on x86_64 and a monotonic nanosecond counter elsewhere.
#[derive(Debug, Clone)]
pub struct TscClock {
    hz: u64,
    #[cfg_attr(target_arch = "x86_64", allow(dead_code))]
    epoch: Instant,
}

impl TscClock {
    /// Calibrate against the monotonic clock over `window`
    pub fn calibrate(window: Duration) -> Self {
        // nanosecond counter unless the TSC is available
        let base = Self { hz: 1_000_000_000, epoch: Instant::now() };
        if !cfg!(target_arch = "x86_64") {
            return base;
        }

        let start_cycles = base.cycles();
        let start = Instant::now();
        std::thread::sleep(window);
        let elapsed = start.elapsed();
        let cycles = base.cycles().saturating_sub(start_cycles);
        let nanos = elapsed.as_nanos().max(1);
        let hz = ((cycles as u128 * 1_000_000_000) / nanos).max(1) as u64;

        tracing::debug!(hz, "cycle clock calibrated");
        Self { hz, epoch: base.epoch }
    }
}

impl Default for TscClock {
    fn default() -> Self {
        Self::calibrate(Duration::from_millis(10))
    }
}

impl Clock for TscClock {
    #[cfg(target_arch = "x86_64")]
    #[inline(always)]
    fn cycles(&self) -> u64 {
        unsafe { std::arch::x86_64::_rdtsc() }
    }

    #[cfg(not(target_arch = "x86_64"))]
    #[inline(always)]
    fn cycles(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn cycles_per_second(&self) -> u64 {
        self.hz
    }
}

/// Manually advanced clock for tests
#[derive(Debug)]
pub struct FakeClock {
    now: AtomicU64,
    hz: u64,
}

impl FakeClock {
    pub fn new(hz: u64) -> Self {
        Self { now: AtomicU64::new(0), hz }
    }

    /// Move time forward
    pub fn advance(&self, cycles: u64) {
        self.now.fetch_add(cycles, Ordering::AcqRel);
    }
}

impl Clock for FakeClock {
    fn cycles(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn cycles_per_second(&self) -> u64 {
        self.hz
    }
}

/// CPU pinning capability
pub trait Affinity: Send + Sync {
    /// Number of cores workers may be placed on
    fn core_count(&self) -> usize;

    /// Pin the calling thread to `core`
    fn pin_current(&self, core: usize) -> DataplaneResult<()>;
}

/// Affinity through the `core_affinity` crate
#[derive(Debug, Clone)]
pub struct SystemAffinity {
    cores: Vec<core_affinity::CoreId>,
}

impl SystemAffinity {
    pub fn new() -> Self {
        let cores = core_affinity::get_core_ids().unwrap_or_default();
        Self { cores }
    }
}

impl Default for SystemAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl Affinity for SystemAffinity {
    fn core_count(&self) -> usize {
        if self.cores.is_empty() {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.cores.len()
        }
    }

    fn pin_current(&self, core: usize) -> DataplaneResult<()> {
        let id = *self.cores.get(core).ok_or(DataplaneError::CoreOutOfRange(core))?;
        if core_affinity::set_for_current(id) {
            tracing::debug!(core, "pinned worker thread");
            Ok(())
        } else {
            Err(DataplaneError::CoreBusy(core))
        }
    }
}

/// Affinity that never pins, remembering requests
#[derive(Debug, Default)]
pub struct NoAffinity {
    cores: usize,
    pinned: Mutex<Vec<usize>>,
}

impl NoAffinity {
    pub fn new(cores: usize) -> Self {
        Self { cores, pinned: Mutex::new(Vec::new()) }
    }

    /// Cores pin requests were made for, in order
    pub fn pinned(&self) -> Vec<usize> {
        self.pinned.lock().clone()
    }
}

impl Affinity for NoAffinity {
    fn core_count(&self) -> usize {
        self.cores
    }

    fn pin_current(&self, core: usize) -> DataplaneResult<()> {
        if core >= self.cores {
            return Err(DataplaneError::CoreOutOfRange(core));
        }
        self.pinned.lock().push(core);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_clock() {
        let clock = FakeClock::new(1_000_000);
        assert_eq!(clock.cycles(), 0);
        clock.advance(500);
        assert_eq!(clock.cycles(), 500);
        assert_eq!(clock.cycles_for(Duration::from_millis(2)), 2_000);
    }

    #[test]
    fn test_tsc_clock_monotonic() {
        let clock = TscClock::calibrate(Duration::from_millis(2));
        assert!(clock.cycles_per_second() > 0);
        let a = clock.cycles();
        let b = clock.cycles();
        assert!(b >= a);
    }

    #[test]
    fn test_no_affinity_records() {
        let affinity = NoAffinity::new(2);
        affinity.pin_current(1).unwrap();
        assert!(affinity.pin_current(2).is_err());
        assert_eq!(affinity.pinned(), vec![1]);
    }

    #[test]
    fn test_system_affinity_counts_cores() {
        assert!(SystemAffinity::new().core_count() >= 1);
    }
}

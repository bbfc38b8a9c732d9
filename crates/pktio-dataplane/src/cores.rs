//! Core assignment
//!
//! Tracks how many workers run on each core and which cores are dedicated
//! to a single worker. Assignment happens at worker start, never on the
//! packet path.

use crate::clock::Affinity;
use crate::error::{DataplaneError, DataplaneResult};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Where a worker would like to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorePreference {
    /// Least loaded shareable core
    Any,
    /// This core
    Manual(usize),
}

#[derive(Debug, Clone, Copy, Default)]
struct CoreSlot {
    workers: usize,
    dedicated: bool,
    disabled: bool,
}

/// Core bookkeeping shared by everything that starts workers
#[derive(Clone)]
pub struct CoreManager {
    cores: Arc<Mutex<Vec<CoreSlot>>>,
}

impl CoreManager {
    pub fn new(core_count: usize) -> Self {
        Self { cores: Arc::new(Mutex::new(vec![CoreSlot::default(); core_count])) }
    }

    /// One slot per core the affinity capability reports
    pub fn from_affinity(affinity: &dyn Affinity) -> Self {
        Self::new(affinity.core_count())
    }

    /// Number of cores
    pub fn core_count(&self) -> usize {
        self.cores.lock().len()
    }

    /// Keep workers off `core` (e.g. the control thread's core)
    pub fn disable(&self, core: usize) -> DataplaneResult<()> {
        let mut cores = self.cores.lock();
        let slot = cores.get_mut(core).ok_or(DataplaneError::CoreOutOfRange(core))?;
        slot.disabled = true;
        Ok(())
    }

    /// Workers currently placed on `core`
    pub fn load(&self, core: usize) -> usize {
        self.cores.lock().get(core).map(|s| s.workers).unwrap_or(0)
    }

    /// Place one worker
    pub fn assign(&self, preference: CorePreference, dedicated: bool) -> DataplaneResult<CoreHandle> {
        let mut cores = self.cores.lock();

        let core = match preference {
            CorePreference::Manual(core) => {
                let slot = cores.get(core).ok_or(DataplaneError::CoreOutOfRange(core))?;
                if slot.disabled || slot.dedicated || (dedicated && slot.workers > 0) {
                    return Err(DataplaneError::CoreBusy(core));
                }
                core
            }
            CorePreference::Any => cores
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.disabled && !s.dedicated && (!dedicated || s.workers == 0))
                .min_by_key(|(i, s)| (s.workers, *i))
                .map(|(i, _)| i)
                .ok_or(DataplaneError::NoCores)?,
        };

        let slot = &mut cores[core];
        slot.workers += 1;
        slot.dedicated = dedicated;

        tracing::debug!(core, dedicated, workers = slot.workers, "core assigned");
        Ok(CoreHandle { core, dedicated, cores: Arc::clone(&self.cores) })
    }
}

impl fmt::Debug for CoreManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreManager").field("cores", &*self.cores.lock()).finish()
    }
}

/// A worker's claim on a core; released on drop
pub struct CoreHandle {
    core: usize,
    dedicated: bool,
    cores: Arc<Mutex<Vec<CoreSlot>>>,
}

impl CoreHandle {
    /// Assigned core id
    pub fn core(&self) -> usize {
        self.core
    }

    /// Whether the core is held exclusively
    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }
}

impl fmt::Debug for CoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreHandle")
            .field("core", &self.core)
            .field("dedicated", &self.dedicated)
            .finish()
    }
}

impl Drop for CoreHandle {
    fn drop(&mut self) {
        let mut cores = self.cores.lock();
        let slot = &mut cores[self.core];
        slot.workers = slot.workers.saturating_sub(1);
        if self.dedicated {
            slot.dedicated = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_picks_least_loaded() {
        let mgr = CoreManager::new(3);
        let a = mgr.assign(CorePreference::Any, false).unwrap();
        let b = mgr.assign(CorePreference::Any, false).unwrap();
        let c = mgr.assign(CorePreference::Any, false).unwrap();
        let d = mgr.assign(CorePreference::Any, false).unwrap();
        assert_eq!([a.core(), b.core(), c.core(), d.core()], [0, 1, 2, 0]);
        assert_eq!(mgr.load(0), 2);
    }

    #[test]
    fn test_manual_out_of_range() {
        let mgr = CoreManager::new(2);
        assert!(matches!(
            mgr.assign(CorePreference::Manual(5), false),
            Err(DataplaneError::CoreOutOfRange(5))
        ));
    }

    #[test]
    fn test_dedicated_core_rules() {
        let mgr = CoreManager::new(2);
        let shared = mgr.assign(CorePreference::Manual(0), false).unwrap();
        assert!(matches!(
            mgr.assign(CorePreference::Manual(0), true),
            Err(DataplaneError::CoreBusy(0))
        ));

        let dedicated = mgr.assign(CorePreference::Any, true).unwrap();
        assert_eq!(dedicated.core(), 1);
        assert!(matches!(
            mgr.assign(CorePreference::Manual(1), false),
            Err(DataplaneError::CoreBusy(1))
        ));
        assert!(matches!(mgr.assign(CorePreference::Any, true), Err(DataplaneError::NoCores)));

        drop(dedicated);
        drop(shared);
        assert!(mgr.assign(CorePreference::Manual(1), true).is_ok());
    }

    #[test]
    fn test_disabled_core_skipped() {
        let mgr = CoreManager::new(2);
        mgr.disable(0).unwrap();
        assert_eq!(mgr.assign(CorePreference::Any, false).unwrap().core(), 1);
        assert!(mgr.assign(CorePreference::Manual(0), false).is_err());
    }
}

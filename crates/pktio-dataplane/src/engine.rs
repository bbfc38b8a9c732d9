//! Worker engine
//!
//! Owns the worker threads of one data plane: places each on a core,
//! optionally pins it, and stops them in start order.

use crate::clock::Affinity;
use crate::config::DataplaneConfig;
use crate::cores::{CoreManager, CorePreference};
use crate::error::DataplaneResult;
use crate::stats::{AggregateStats, CoreStatsSnapshot};
use crate::worker::{Worker, WorkerHandle, WorkerState};
use std::sync::Arc;
use std::time::Instant;

/// Engine
///
/// Manages per-core packet workers with:
/// - Least-loaded or manual core placement
/// - Optional dedicated cores and thread pinning
/// - Cooperative stop on `stop()` and on drop
pub struct Engine {
    cores: CoreManager,
    affinity: Arc<dyn Affinity>,
    pin_cores: bool,
    dedicated_cores: bool,
    workers: Vec<WorkerHandle>,
    stats: AggregateStats,
    started: Option<Instant>,
}

impl Engine {
    /// Create an engine placing workers on the cores `affinity` reports
    pub fn new(config: &DataplaneConfig, affinity: Arc<dyn Affinity>) -> Self {
        Self {
            cores: CoreManager::from_affinity(affinity.as_ref()),
            affinity,
            pin_cores: config.pin_cores,
            dedicated_cores: config.dedicated_cores,
            workers: Vec::new(),
            stats: AggregateStats::new(),
            started: None,
        }
    }

    /// Core bookkeeping, e.g. to keep workers off the control core
    pub fn cores(&self) -> &CoreManager {
        &self.cores
    }

    /// Start `worker` on a core chosen by `preference`
    pub fn spawn(&mut self, worker: Worker, preference: CorePreference) -> DataplaneResult<usize> {
        let id = worker.id();
        let core = self.cores.assign(preference, self.dedicated_cores)?;
        let core_id = core.core();
        let affinity = self.pin_cores.then(|| Arc::clone(&self.affinity));

        let stats = worker.stats();
        let handle = worker.spawn_on(Some(core), affinity)?;
        self.stats.register(stats);
        self.workers.push(handle);
        self.started.get_or_insert_with(Instant::now);

        tracing::debug!(worker = id, core = core_id, pinned = self.pin_cores, "worker started");
        Ok(core_id)
    }

    /// Number of workers started and not yet stopped
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// States of the live workers, in start order
    pub fn states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(|w| w.state()).collect()
    }

    /// Counters summed over every worker ever started
    pub fn stats(&self) -> CoreStatsSnapshot {
        self.stats.total()
    }

    /// Seconds since the first worker started
    pub fn elapsed_secs(&self) -> f64 {
        self.started.map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0)
    }

    /// Stop all workers and wait for them; returns each worker's final counters
    ///
    /// Workers stop one at a time in start order, so spawn pipeline stages
    /// upstream first: each stage is joined only after everything upstream
    /// has drained into it, and downstream stages keep running meanwhile.
    pub fn stop(&mut self) -> Vec<CoreStatsSnapshot> {
        if self.workers.is_empty() {
            return Vec::new();
        }

        let finals: Vec<CoreStatsSnapshot> = self
            .workers
            .drain(..)
            .map(|worker| {
                worker.request_stop();
                worker.join()
            })
            .collect();

        let total = self.stats.total();
        tracing::info!(
            workers = finals.len(),
            rx = total.rx_packets,
            tx = total.tx_packets,
            "engine stopped"
        );
        finals
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

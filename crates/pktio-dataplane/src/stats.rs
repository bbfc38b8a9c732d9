//! Worker Statistics
//!
//! Lock-free counters written by one worker and read by anyone.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-core stats (cache-line aligned)
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CoreStats {
    pub rx_packets: AtomicU64,
    pub tx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub tx_bytes: AtomicU64,
    /// Dropped by the packet processor
    pub dropped: AtomicU64,
    /// Dropped because the output kept rejecting them
    pub tx_dropped: AtomicU64,
    /// Output rejected part of a burst
    pub backpressure_events: AtomicU64,
    /// Cycles that saw a device error
    pub device_errors: AtomicU64,
    /// Escalated device alarms
    pub alarms: AtomicU64,
    /// Copies not recorded because the capture ring was full
    pub capture_dropped: AtomicU64,
    /// Polls that returned nothing
    pub idle_polls: AtomicU64,
    /// Cycles spent on bursts that moved packets
    pub busy_cycles: AtomicU64,
    /// Cycles since the worker started running
    pub total_cycles: AtomicU64,
}

impl CoreStats {
    #[inline(always)]
    pub fn record_rx(&self, packets: u64, bytes: u64) {
        self.rx_packets.fetch_add(packets, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_tx(&self, packets: u64, bytes: u64) {
        self.tx_packets.fetch_add(packets, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_drop(&self, packets: u64) {
        self.dropped.fetch_add(packets, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_tx_drop(&self, packets: u64) {
        self.tx_dropped.fetch_add(packets, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_backpressure(&self) {
        self.backpressure_events.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_device_error(&self) {
        self.device_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_alarm(&self) {
        self.alarms.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_capture_drop(&self) {
        self.capture_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_idle(&self) {
        self.idle_polls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_cycles(&self, busy: u64, total: u64) {
        self.busy_cycles.fetch_add(busy, Ordering::Relaxed);
        self.total_cycles.store(total, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CoreStatsSnapshot {
        CoreStatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
            alarms: self.alarms.load(Ordering::Relaxed),
            capture_dropped: self.capture_dropped.load(Ordering::Relaxed),
            idle_polls: self.idle_polls.load(Ordering::Relaxed),
            busy_cycles: self.busy_cycles.load(Ordering::Relaxed),
            total_cycles: self.total_cycles.load(Ordering::Relaxed),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreStatsSnapshot {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub dropped: u64,
    pub tx_dropped: u64,
    pub backpressure_events: u64,
    pub device_errors: u64,
    pub alarms: u64,
    pub capture_dropped: u64,
    pub idle_polls: u64,
    pub busy_cycles: u64,
    pub total_cycles: u64,
}

impl CoreStatsSnapshot {
    pub fn throughput_gbps(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 { return 0.0; }
        let bytes = self.rx_bytes + self.tx_bytes;
        (bytes as f64 * 8.0) / (elapsed_secs * 1_000_000_000.0)
    }

    pub fn packet_rate_mpps(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 { return 0.0; }
        let packets = self.rx_packets + self.tx_packets;
        packets as f64 / (elapsed_secs * 1_000_000.0)
    }

    /// Share of cycles spent moving packets
    pub fn utilization(&self) -> f64 {
        if self.total_cycles == 0 { return 0.0; }
        (self.busy_cycles as f64 / self.total_cycles as f64).min(1.0)
    }

    /// Counter-wise sum
    pub fn merge(&mut self, other: &CoreStatsSnapshot) {
        self.rx_packets += other.rx_packets;
        self.tx_packets += other.tx_packets;
        self.rx_bytes += other.rx_bytes;
        self.tx_bytes += other.tx_bytes;
        self.dropped += other.dropped;
        self.tx_dropped += other.tx_dropped;
        self.backpressure_events += other.backpressure_events;
        self.device_errors += other.device_errors;
        self.alarms += other.alarms;
        self.capture_dropped += other.capture_dropped;
        self.idle_polls += other.idle_polls;
        self.busy_cycles += other.busy_cycles;
        self.total_cycles += other.total_cycles;
    }
}

/// Aggregate stats across all cores
#[derive(Debug, Default)]
pub struct AggregateStats {
    cores: Vec<std::sync::Arc<CoreStats>>,
}

impl AggregateStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track one more worker's counters
    pub fn register(&mut self, stats: std::sync::Arc<CoreStats>) {
        self.cores.push(stats);
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    pub fn core(&self, idx: usize) -> &CoreStats {
        &self.cores[idx]
    }

    pub fn total(&self) -> CoreStatsSnapshot {
        let mut total = CoreStatsSnapshot::default();
        for core in &self.cores {
            total.merge(&core.snapshot());
        }
        total
    }
}

/// Register descriptions of the exported counters
pub fn describe_metrics() {
    metrics::describe_counter!("pktio_rx_packets", "Packets pulled by workers");
    metrics::describe_counter!("pktio_tx_packets", "Packets handed to outputs");
    metrics::describe_counter!("pktio_dropped", "Packets dropped by processors or backpressure");
    metrics::describe_counter!("pktio_device_errors", "Worker cycles that observed a device error");
    metrics::describe_counter!("pktio_device_alarms", "Persistent device error alarms");
}

/// Publishes counter deltas through the `metrics` facade
#[derive(Debug)]
pub struct MetricsReporter {
    core: String,
    last: CoreStatsSnapshot,
}

impl MetricsReporter {
    pub fn new(core: impl Into<String>) -> Self {
        Self { core: core.into(), last: CoreStatsSnapshot::default() }
    }

    /// Push what changed since the previous report
    pub fn report(&mut self, stats: &CoreStats) {
        let now = stats.snapshot();
        let last = self.last;
        let deltas = [
            ("pktio_rx_packets", now.rx_packets - last.rx_packets),
            ("pktio_tx_packets", now.tx_packets - last.tx_packets),
            (
                "pktio_dropped",
                (now.dropped + now.tx_dropped) - (last.dropped + last.tx_dropped),
            ),
            ("pktio_device_errors", now.device_errors - last.device_errors),
            ("pktio_device_alarms", now.alarms - last.alarms),
        ];
        for (name, delta) in deltas {
            if delta > 0 {
                metrics::counter!(name, "core" => self.core.clone()).increment(delta);
            }
        }
        self.last = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_core_stats() {
        let stats = CoreStats::default();
        stats.record_rx(1, 1500);
        stats.record_tx(1, 1500);
        stats.record_drop(2);

        let snap = stats.snapshot();
        assert_eq!(snap.rx_packets, 1);
        assert_eq!(snap.rx_bytes, 1500);
        assert_eq!(snap.dropped, 2);
    }

    #[test]
    fn test_aggregate() {
        let mut agg = AggregateStats::new();
        agg.register(Arc::new(CoreStats::default()));
        agg.register(Arc::new(CoreStats::default()));
        agg.core(0).record_rx(1, 1000);
        agg.core(1).record_rx(1, 2000);

        let total = agg.total();
        assert_eq!(total.rx_packets, 2);
        assert_eq!(total.rx_bytes, 3000);
    }

    #[test]
    fn test_rates() {
        let snap = CoreStatsSnapshot {
            rx_packets: 1_000_000,
            rx_bytes: 125_000_000,
            busy_cycles: 50,
            total_cycles: 100,
            ..Default::default()
        };
        assert_eq!(snap.packet_rate_mpps(1.0), 1.0);
        assert_eq!(snap.throughput_gbps(1.0), 1.0);
        assert_eq!(snap.utilization(), 0.5);
        assert_eq!(snap.throughput_gbps(0.0), 0.0);
    }

    #[test]
    fn test_reporter_tracks_last_report() {
        let stats = CoreStats::default();
        let mut reporter = MetricsReporter::new("0");
        stats.record_rx(3, 300);
        reporter.report(&stats);
        assert_eq!(reporter.last.rx_packets, 3);

        stats.record_rx(2, 200);
        stats.record_alarm();
        reporter.report(&stats);
        assert_eq!(reporter.last.rx_packets, 5);
        assert_eq!(reporter.last.alarms, 1);
    }
}

//! Per-core worker runtime
//!
//! A worker pulls bursts from one input, runs each packet through a
//! [`PacketProcessor`] and pushes the survivors to one output.
//!
//! # Lifecycle
//! `Created -> Running -> Draining -> Stopped`, held in a shared atomic cell.
//! Stop requests are cooperative and checked between bursts.

use crate::buffer::Mbuf;
use crate::capture::CaptureTap;
use crate::clock::{Affinity, Clock, TscClock};
use crate::config::WorkerConfig;
use crate::cores::CoreHandle;
use crate::error::{DataplaneError, DataplaneResult, ErrorCode};
use crate::pacer::RatePacer;
use crate::port::{BurstPort, DeviceManager};
use crate::ring::Ring;
use crate::stats::{CoreStats, CoreStatsSnapshot, MetricsReporter};
use crate::txbuf::{FlushOutcome, TxBuffer, TxTarget};
use crossbeam::utils::Backoff;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Worker lifecycle state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerState {
    Created = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Created,
            1 => WorkerState::Running,
            2 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }
}

/// Shared lifecycle cell; only moves forward
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(WorkerState::Created as u8))
    }

    #[inline]
    pub fn load(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move `from -> to`; fails if the state is not `from` or `to` is not later
    pub fn advance(&self, from: WorkerState, to: WorkerState) -> bool {
        to > from
            && self
                .0
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    fn finish(&self) {
        self.0.store(WorkerState::Stopped as u8, Ordering::Release);
    }

    /// Ask for `Draining` unless already there or past it
    pub fn request_stop(&self) {
        let mut current = self.load();
        while current < WorkerState::Draining {
            if self.advance(current, WorkerState::Draining) {
                return;
            }
            current = self.load();
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// What a processor decided for one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Forward,
    Drop,
}

/// Per-burst information handed to the processor
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext {
    pub worker_id: usize,
    pub core: Option<usize>,
    /// Cycle count when the burst was pulled
    pub now: u64,
    pub cycles_per_second: u64,
}

/// Packet processing stage
pub trait PacketProcessor: Send {
    fn process(&mut self, pkt: &mut Mbuf, ctx: &WorkerContext) -> Verdict;
}

impl<F> PacketProcessor for F
where
    F: FnMut(&mut Mbuf, &WorkerContext) -> Verdict + Send,
{
    #[inline]
    fn process(&mut self, pkt: &mut Mbuf, ctx: &WorkerContext) -> Verdict {
        self(pkt, ctx)
    }
}

/// Forwards everything untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl PacketProcessor for PassThrough {
    #[inline(always)]
    fn process(&mut self, _pkt: &mut Mbuf, _ctx: &WorkerContext) -> Verdict {
        Verdict::Forward
    }
}

/// Where a worker pulls from
pub enum Input {
    Port(Box<dyn BurstPort>),
    Ring(Arc<Ring<Mbuf>>),
}

/// Where a worker pushes to
pub enum Output {
    Port(Box<dyn BurstPort>),
    Ring(Arc<Ring<Mbuf>>),
    /// Back out of the input port
    Loopback,
    /// Free forwarded packets
    Discard,
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Input::Port(port) => write!(f, "Port({})", port.id()),
            Input::Ring(ring) => write!(f, "Ring({})", ring.name()),
        }
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Port(port) => write!(f, "Port({})", port.id()),
            Output::Ring(ring) => write!(f, "Ring({})", ring.name()),
            Output::Loopback => f.write_str("Loopback"),
            Output::Discard => f.write_str("Discard"),
        }
    }
}

fn route<'a>(output: &'a mut Output, input: &'a mut Input) -> Option<&'a mut dyn TxTarget> {
    match output {
        Output::Port(port) => Some(port as &mut dyn TxTarget),
        Output::Ring(ring) => Some(ring as &mut dyn TxTarget),
        Output::Loopback => match input {
            Input::Port(port) => Some(port as &mut dyn TxTarget),
            Input::Ring(_) => None,
        },
        Output::Discard => None,
    }
}

/// Builder for [`Worker`]
pub struct WorkerBuilder {
    id: usize,
    input: Option<Input>,
    output: Output,
    processor: Box<dyn PacketProcessor>,
    clock: Option<Arc<dyn Clock>>,
    config: WorkerConfig,
    devices: Option<Arc<dyn DeviceManager>>,
    capture: Option<Arc<CaptureTap>>,
}

impl WorkerBuilder {
    pub fn input(mut self, input: Input) -> Self {
        self.input = Some(input);
        self
    }

    pub fn output(mut self, output: Output) -> Self {
        self.output = output;
        self
    }

    pub fn processor(mut self, processor: impl PacketProcessor + 'static) -> Self {
        self.processor = Box::new(processor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Poll `devices` for errors on the worker's ports every cycle
    pub fn device_errors(mut self, devices: Arc<dyn DeviceManager>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn capture(mut self, tap: Arc<CaptureTap>) -> Self {
        self.capture = Some(tap);
        self
    }

    pub fn build(self) -> DataplaneResult<Worker> {
        self.config.validate()?;
        let input = self
            .input
            .ok_or_else(|| DataplaneError::Config(format!("worker {} has no input", self.id)))?;
        if matches!((&input, &self.output), (Input::Ring(_), Output::Loopback)) {
            return Err(DataplaneError::Config(format!(
                "worker {}: loopback needs a port input",
                self.id
            )));
        }

        let mut devices = Vec::new();
        if let Input::Port(port) = &input {
            devices.push(port.id().device);
        }
        if let Output::Port(port) = &self.output {
            devices.push(port.id().device);
        }
        devices.sort_unstable();
        devices.dedup();
        let watched = devices.into_iter().map(|device| (device, 0)).collect();

        let clock = self.clock.unwrap_or_else(|| Arc::new(TscClock::default()));
        let pacer = self.config.rate_pps.map(|pps| {
            RatePacer::new(pps, clock.cycles_per_second(), self.config.burst_size, clock.cycles())
        });
        let stats_interval = clock.cycles_for(Duration::from_millis(self.config.stats_interval_ms));

        Ok(Worker {
            id: self.id,
            core: None,
            input,
            output: self.output,
            processor: self.processor,
            rx: Vec::with_capacity(self.config.burst_size),
            tx: TxBuffer::new(self.config.burst_size, self.config.backpressure),
            pacer,
            clock,
            devices: self.devices,
            watched,
            error_streak: 0,
            capture: self.capture,
            state: Arc::new(StateCell::new()),
            stats: Arc::new(CoreStats::default()),
            reporter: MetricsReporter::new(format!("worker-{}", self.id)),
            stats_interval,
            started: 0,
            next_report: 0,
            config: self.config,
        })
    }
}

/// One packet loop, run on its own thread
pub struct Worker {
    id: usize,
    core: Option<usize>,
    input: Input,
    output: Output,
    processor: Box<dyn PacketProcessor>,
    rx: Vec<Mbuf>,
    tx: TxBuffer,
    pacer: Option<RatePacer>,
    clock: Arc<dyn Clock>,
    devices: Option<Arc<dyn DeviceManager>>,
    /// (device, error count seen so far)
    watched: Vec<(u16, u64)>,
    error_streak: u32,
    capture: Option<Arc<CaptureTap>>,
    state: Arc<StateCell>,
    stats: Arc<CoreStats>,
    reporter: MetricsReporter,
    stats_interval: u64,
    started: u64,
    next_report: u64,
    config: WorkerConfig,
}

impl Worker {
    pub fn builder(id: usize) -> WorkerBuilder {
        WorkerBuilder {
            id,
            input: None,
            output: Output::Discard,
            processor: Box::new(PassThrough),
            clock: None,
            config: WorkerConfig::default(),
            devices: None,
            capture: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state.load()
    }

    /// Shared lifecycle cell, for stopping the worker from elsewhere
    pub fn state_cell(&self) -> Arc<StateCell> {
        Arc::clone(&self.state)
    }

    pub fn stats(&self) -> Arc<CoreStats> {
        Arc::clone(&self.stats)
    }

    /// Spawn on an unpinned thread
    pub fn spawn(self) -> DataplaneResult<WorkerHandle> {
        self.spawn_on(None, None)
    }

    /// Spawn, optionally holding `core` and pinning through `affinity`
    pub(crate) fn spawn_on(
        mut self,
        core: Option<CoreHandle>,
        affinity: Option<Arc<dyn Affinity>>,
    ) -> DataplaneResult<WorkerHandle> {
        let id = self.id;
        self.core = core.as_ref().map(|c| c.core());
        if let Some(core) = self.core {
            self.reporter = MetricsReporter::new(core.to_string());
        }
        let state = self.state_cell();
        let stats = self.stats();
        let pin = self.core.zip(affinity);

        let thread = thread::Builder::new()
            .name(format!("pktio-worker-{}", id))
            .spawn(move || {
                if let Some((core, affinity)) = pin {
                    if let Err(e) = affinity.pin_current(core) {
                        tracing::warn!(worker = id, core, error = %e, "could not pin worker");
                    }
                }
                self.run()
            })?;

        Ok(WorkerHandle { id, state, stats, thread: Some(thread), core })
    }

    /// Run until stopped, then drain; returns the final counters
    pub fn run(mut self) -> CoreStatsSnapshot {
        self.started = self.clock.cycles();
        self.next_report = self.started + self.stats_interval;

        if self.state.advance(WorkerState::Created, WorkerState::Running) {
            tracing::info!(worker = self.id, core = ?self.core, input = ?self.input, output = ?self.output, "worker running");
            let backoff = Backoff::new();
            while self.state.load() == WorkerState::Running {
                if self.poll_once() == 0 {
                    backoff.snooze();
                } else {
                    backoff.reset();
                }
            }
        } else {
            tracing::debug!(worker = self.id, "stopped before start");
        }

        self.drain();
        self.state.finish();
        self.reporter.report(&self.stats);

        let snapshot = self.stats.snapshot();
        tracing::info!(
            worker = self.id,
            rx = snapshot.rx_packets,
            tx = snapshot.tx_packets,
            dropped = snapshot.dropped + snapshot.tx_dropped,
            "worker stopped"
        );
        snapshot
    }

    /// One cycle: pull, process, push. Returns packets pulled.
    pub fn poll_once(&mut self) -> usize {
        let now = self.clock.cycles();
        // a backed-up output stops intake
        let mut want = if self.tx.len() >= self.tx.threshold() { 0 } else { self.config.burst_size };
        if let Some(pacer) = &mut self.pacer {
            want = pacer.allowance(now, want);
        }

        let n = if want == 0 {
            0
        } else {
            match &mut self.input {
                Input::Port(port) => port.rx_burst(&mut self.rx, want),
                Input::Ring(ring) => ring.dequeue_bulk(&mut self.rx, want).count,
            }
        };
        if let Some(pacer) = &mut self.pacer {
            pacer.consume(n);
        }

        if n > 0 {
            self.process_burst(now);
        } else {
            self.stats.record_idle();
        }

        let outcome = match route(&mut self.output, &mut self.input) {
            Some(target) => self.tx.flush(target),
            None => self.tx.discard(),
        };
        self.record_flush(outcome);
        self.check_device_errors();

        let end = self.clock.cycles();
        let busy = if n > 0 { end.saturating_sub(now) } else { 0 };
        self.stats.record_cycles(busy, end.saturating_sub(self.started));
        if end >= self.next_report {
            self.reporter.report(&self.stats);
            self.next_report = end + self.stats_interval;
        }
        n
    }

    fn process_burst(&mut self, now: u64) {
        let ctx = WorkerContext {
            worker_id: self.id,
            core: self.core,
            now,
            cycles_per_second: self.clock.cycles_per_second(),
        };

        let bytes: u64 = self.rx.iter().map(|p| p.len() as u64).sum();
        self.stats.record_rx(self.rx.len() as u64, bytes);

        let mut burst = std::mem::take(&mut self.rx);
        let mut outcome = FlushOutcome::default();
        let mut dropped = 0u64;
        for mut pkt in burst.drain(..) {
            match self.processor.process(&mut pkt, &ctx) {
                Verdict::Forward => {
                    if let Some(tap) = &self.capture {
                        if !tap.tap(&pkt) {
                            self.stats.record_capture_drop();
                        }
                    }
                    match route(&mut self.output, &mut self.input) {
                        Some(target) => outcome.merge(self.tx.buffer(pkt, target)),
                        None => {
                            outcome.sent += 1;
                            outcome.sent_bytes += pkt.len() as u64;
                        }
                    }
                }
                Verdict::Drop => dropped += 1,
            }
        }
        self.rx = burst;

        if dropped > 0 {
            self.stats.record_drop(dropped);
        }
        self.record_flush(outcome);
    }

    fn record_flush(&mut self, outcome: FlushOutcome) {
        if outcome.sent > 0 {
            self.stats.record_tx(outcome.sent as u64, outcome.sent_bytes);
        }
        if outcome.rejected {
            self.stats.record_backpressure();
        }
        if outcome.dropped > 0 {
            self.stats.record_tx_drop(outcome.dropped as u64);
            tracing::warn!(worker = self.id, dropped = outcome.dropped, "output backpressure, packets dropped");
        }
    }

    fn check_device_errors(&mut self) {
        let Some(devices) = &self.devices else {
            return;
        };

        let mut seen = None;
        for (device, count) in &mut self.watched {
            let now = devices.error_count(*device);
            if now != *count {
                *count = now;
                let code = devices.last_error_code(*device).unwrap_or(ErrorCode::Other(0));
                seen = Some((*device, code));
            }
        }

        let Some((device, code)) = seen else {
            self.error_streak = 0;
            return;
        };

        self.stats.record_device_error();
        self.error_streak = self.error_streak.saturating_add(1);
        tracing::warn!(worker = self.id, device, %code, streak = self.error_streak, "device error");

        if self.error_streak == self.config.alarm_threshold {
            self.stats.record_alarm();
            tracing::error!(
                worker = self.id,
                device,
                %code,
                cycles = self.error_streak,
                "persistent device errors"
            );
        }
    }

    /// Finish in-flight packets: what already sits on an input ring plus
    /// what is pending for the output. No new port receives are issued.
    fn drain(&mut self) {
        if let Input::Ring(ring) = &self.input {
            let ring = Arc::clone(ring);
            // bounded by what was queued when draining began
            let mut left = ring.count();
            while left > 0 {
                let n = ring.dequeue_bulk(&mut self.rx, left.min(self.config.burst_size)).count;
                if n == 0 {
                    break;
                }
                left = left.saturating_sub(n);
                let now = self.clock.cycles();
                self.process_burst(now);
                self.flush_pending();
            }
        }
        self.flush_pending();
    }

    /// Push out what is pending, dropping what will not go
    fn flush_pending(&mut self) {
        let backoff = Backoff::new();
        let mut attempts = 0;
        while !self.tx.is_empty() && attempts < self.config.drain_attempts {
            let outcome = match route(&mut self.output, &mut self.input) {
                Some(target) => self.tx.try_flush(target),
                None => self.tx.discard(),
            };
            self.record_flush(outcome);
            attempts += 1;
            if !self.tx.is_empty() {
                backoff.snooze();
            }
        }

        if !self.tx.is_empty() {
            let n = self.tx.drop_pending();
            self.stats.record_tx_drop(n as u64);
            tracing::warn!(worker = self.id, dropped = n, attempts, "dropped pending packets on drain");
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("core", &self.core)
            .field("state", &self.state.load())
            .field("input", &self.input)
            .field("output", &self.output)
            .finish()
    }
}

/// Control side of a spawned worker
pub struct WorkerHandle {
    id: usize,
    state: Arc<StateCell>,
    stats: Arc<CoreStats>,
    thread: Option<JoinHandle<CoreStatsSnapshot>>,
    core: Option<CoreHandle>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Assigned core, if any
    pub fn core(&self) -> Option<usize> {
        self.core.as_ref().map(|c| c.core())
    }

    pub fn state(&self) -> WorkerState {
        self.state.load()
    }

    /// Live counters
    pub fn stats(&self) -> Arc<CoreStats> {
        Arc::clone(&self.stats)
    }

    /// Ask the worker to drain and stop
    pub fn request_stop(&self) {
        self.state.request_stop();
    }

    /// Wait for the worker thread; returns its final counters
    pub fn join(mut self) -> CoreStatsSnapshot {
        self.wait()
    }

    fn wait(&mut self) -> CoreStatsSnapshot {
        let Some(thread) = self.thread.take() else {
            return self.stats.snapshot();
        };
        match thread.join() {
            Ok(snapshot) => snapshot,
            Err(_) => {
                tracing::error!(worker = self.id, "worker thread panicked");
                self.stats.snapshot()
            }
        }
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("core", &self.core())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.request_stop();
            self.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::capture::MemoryCapture;
    use crate::clock::FakeClock;
    use crate::config::{BackpressurePolicy, DeviceConfig, PoolConfig};
    use crate::port::{PortId, QueueConfig};
    use crate::virtual_dev::VirtualDevice;
    use std::time::Instant;

    fn setup(buffers: usize) -> (VirtualDevice, Arc<FakeClock>) {
        let pool = BufferPool::new("worker", &PoolConfig { capacity: buffers, ..Default::default() }).unwrap();
        let dev = VirtualDevice::new(pool, &DeviceConfig::default()).unwrap();
        (dev, Arc::new(FakeClock::new(1_000_000)))
    }

    fn ring(capacity: usize) -> Arc<Ring<Mbuf>> {
        Arc::new(Ring::new("stage", capacity).unwrap())
    }

    fn inject(dev: &VirtualDevice, device: u16, n: usize) {
        for i in 0..n {
            assert!(dev.inject(PortId::new(device, 0), &[i as u8; 64]).unwrap());
        }
    }

    #[test]
    fn test_state_only_moves_forward() {
        let cell = StateCell::new();
        assert!(cell.advance(WorkerState::Created, WorkerState::Running));
        assert!(!cell.advance(WorkerState::Running, WorkerState::Created));
        assert!(!cell.advance(WorkerState::Created, WorkerState::Draining));
        cell.request_stop();
        assert_eq!(cell.load(), WorkerState::Draining);
        cell.request_stop();
        assert_eq!(cell.load(), WorkerState::Draining);
    }

    #[test]
    fn test_missing_input_rejected() {
        assert!(Worker::builder(0).build().is_err());
        let err = Worker::builder(0).input(Input::Ring(ring(8))).output(Output::Loopback).build();
        assert!(matches!(err, Err(DataplaneError::Config(_))));
    }

    #[test]
    fn test_port_to_ring() {
        let (dev, clock) = setup(64);
        let port = dev.open_port(0, &QueueConfig::default()).unwrap();
        let out = ring(64);
        let mut worker = Worker::builder(0)
            .input(Input::Port(port))
            .output(Output::Ring(Arc::clone(&out)))
            .clock(clock)
            .build()
            .unwrap();

        inject(&dev, 0, 5);
        assert_eq!(worker.poll_once(), 5);
        assert_eq!(out.count(), 5);
        assert_eq!(out.dequeue().unwrap().data()[0], 0);

        let snap = worker.stats().snapshot();
        assert_eq!((snap.rx_packets, snap.tx_packets), (5, 5));
        assert_eq!(snap.rx_bytes, 5 * 64);
        assert_eq!(worker.poll_once(), 0);
        assert_eq!(worker.stats().snapshot().idle_polls, 1);
    }

    #[test]
    fn test_processor_drops_are_freed() {
        let (dev, clock) = setup(64);
        let input = ring(64);
        let out = ring(64);
        let mut worker = Worker::builder(1)
            .input(Input::Ring(Arc::clone(&input)))
            .output(Output::Ring(Arc::clone(&out)))
            .processor(|pkt: &mut Mbuf, _: &WorkerContext| {
                if pkt.data()[0] % 2 == 0 { Verdict::Forward } else { Verdict::Drop }
            })
            .clock(clock)
            .build()
            .unwrap();

        for i in 0..6u8 {
            let mut pkt = dev.pool().alloc().unwrap();
            pkt.copy_from_slice(&[i; 10]);
            input.enqueue(pkt).unwrap();
        }
        assert_eq!(worker.poll_once(), 6);
        assert_eq!(out.count(), 3);
        assert_eq!(worker.stats().snapshot().dropped, 3);
        assert_eq!(dev.pool().in_use(), 3);
    }

    #[test]
    fn test_drop_policy_under_backpressure() {
        let (dev, clock) = setup(64);
        let input = ring(64);
        let out = ring(4);
        let mut worker = Worker::builder(0)
            .input(Input::Ring(Arc::clone(&input)))
            .output(Output::Ring(Arc::clone(&out)))
            .config(WorkerConfig { backpressure: BackpressurePolicy::Drop, ..Default::default() })
            .clock(clock)
            .build()
            .unwrap();

        let mut pkts = dev.pool().alloc_bulk(8).unwrap();
        input.enqueue_exact(&mut pkts).unwrap();
        assert_eq!(worker.poll_once(), 8);

        let snap = worker.stats().snapshot();
        assert_eq!(snap.tx_packets, 4);
        assert_eq!(snap.tx_dropped, 4);
        assert_eq!(snap.backpressure_events, 1);
        assert_eq!(dev.pool().in_use(), 4);
    }

    #[test]
    fn test_retry_policy_holds_then_drops() {
        let (dev, clock) = setup(64);
        let input = ring(64);
        let out = ring(4);
        let mut worker = Worker::builder(0)
            .input(Input::Ring(Arc::clone(&input)))
            .output(Output::Ring(Arc::clone(&out)))
            .config(WorkerConfig {
                backpressure: BackpressurePolicy::Retry { max_attempts: 1 },
                ..Default::default()
            })
            .clock(clock)
            .build()
            .unwrap();

        let mut pkts = dev.pool().alloc_bulk(8).unwrap();
        input.enqueue_exact(&mut pkts).unwrap();
        worker.poll_once();
        assert_eq!(worker.stats().snapshot().tx_dropped, 0);
        assert_eq!(dev.pool().in_use(), 8);

        // output still full: second refusal exceeds the budget
        worker.poll_once();
        assert_eq!(worker.stats().snapshot().tx_dropped, 4);
        assert_eq!(dev.pool().in_use(), 4);
    }

    #[test]
    fn test_backed_up_output_stops_intake() {
        let (dev, clock) = setup(64);
        let input = ring(64);
        let out = ring(4);
        let mut worker = Worker::builder(0)
            .input(Input::Ring(Arc::clone(&input)))
            .output(Output::Ring(Arc::clone(&out)))
            .config(WorkerConfig {
                burst_size: 8,
                backpressure: BackpressurePolicy::Retry { max_attempts: 100 },
                ..Default::default()
            })
            .clock(clock)
            .build()
            .unwrap();

        let mut pkts = dev.pool().alloc_bulk(24).unwrap();
        input.enqueue_exact(&mut pkts).unwrap();
        assert_eq!(worker.poll_once(), 8);
        assert_eq!(worker.poll_once(), 8);
        assert_eq!(worker.tx.len(), 12);
        assert_eq!(worker.poll_once(), 0);
        assert_eq!(input.count(), 8);
    }

    #[test]
    fn test_loopback() {
        let (dev, clock) = setup(64);
        let port = dev.open_port(1, &QueueConfig::default()).unwrap();
        let mut worker = Worker::builder(0)
            .input(Input::Port(port))
            .output(Output::Loopback)
            .clock(clock)
            .build()
            .unwrap();

        inject(&dev, 1, 3);
        worker.poll_once();
        let mut wire = Vec::new();
        assert_eq!(dev.drain_tx(PortId::new(1, 0), &mut wire, 32).unwrap(), 3);
    }

    #[test]
    fn test_discard_output_frees() {
        let (dev, clock) = setup(64);
        let port = dev.open_port(0, &QueueConfig::default()).unwrap();
        let mut worker = Worker::builder(0).input(Input::Port(port)).clock(clock).build().unwrap();

        inject(&dev, 0, 4);
        assert_eq!(worker.poll_once(), 4);
        assert_eq!(worker.stats().snapshot().tx_packets, 4);
        assert_eq!(dev.pool().in_use(), 0);
    }

    #[test]
    fn test_rate_pacing() {
        let (dev, clock) = setup(128);
        let input = ring(128);
        let mut worker = Worker::builder(0)
            .input(Input::Ring(Arc::clone(&input)))
            .config(WorkerConfig { rate_pps: Some(1_000), ..Default::default() })
            .clock(clock.clone())
            .build()
            .unwrap();

        let mut pkts = dev.pool().alloc_bulk(40).unwrap();
        input.enqueue_exact(&mut pkts).unwrap();
        assert_eq!(worker.poll_once(), 32);
        assert_eq!(worker.poll_once(), 0);
        clock.advance(5_000);
        assert_eq!(worker.poll_once(), 5);
    }

    #[test]
    fn test_device_errors_raise_one_alarm_per_streak() {
        let (dev, clock) = setup(64);
        let port = dev.open_port(0, &QueueConfig::default()).unwrap();
        let devices: Arc<dyn DeviceManager> = Arc::new(dev.clone());
        let mut worker = Worker::builder(0)
            .input(Input::Port(port))
            .config(WorkerConfig { alarm_threshold: 2, ..Default::default() })
            .device_errors(devices)
            .clock(clock)
            .build()
            .unwrap();

        for _ in 0..3 {
            dev.raise_error(0, ErrorCode::TxTimeout).unwrap();
            worker.poll_once();
        }
        let snap = worker.stats().snapshot();
        assert_eq!((snap.device_errors, snap.alarms), (3, 1));

        worker.poll_once();
        for _ in 0..2 {
            dev.raise_error(0, ErrorCode::Other(-5)).unwrap();
            worker.poll_once();
        }
        let snap = worker.stats().snapshot();
        assert_eq!((snap.device_errors, snap.alarms), (5, 2));
        assert_eq!(worker.state(), WorkerState::Created);
    }

    #[test]
    fn test_workers_sharing_a_device_each_see_errors() {
        let pool = BufferPool::new("shared", &PoolConfig { capacity: 16, ..Default::default() }).unwrap();
        let config = DeviceConfig { rx_queues: 2, tx_queues: 2, ..Default::default() };
        let dev = VirtualDevice::new(pool, &config).unwrap();
        let devices: Arc<dyn DeviceManager> = Arc::new(dev.clone());
        let clock = Arc::new(FakeClock::new(1_000_000));

        let mut workers: Vec<Worker> = (0..2u16)
            .map(|queue| {
                let port = dev.open_port(0, &QueueConfig { queue, ..Default::default() }).unwrap();
                Worker::builder(queue as usize)
                    .input(Input::Port(port))
                    .device_errors(Arc::clone(&devices))
                    .clock(clock.clone())
                    .build()
                    .unwrap()
            })
            .collect();

        dev.raise_error(0, ErrorCode::TxTimeout).unwrap();
        for worker in &mut workers {
            worker.poll_once();
            worker.poll_once();
        }
        for worker in &workers {
            assert_eq!(worker.stats().snapshot().device_errors, 1);
        }
    }

    #[test]
    fn test_capture_tap() {
        let (dev, clock) = setup(64);
        let port = dev.open_port(0, &QueueConfig::default()).unwrap();
        let tap = Arc::new(CaptureTap::new("tap", 2).unwrap());
        let mut worker = Worker::builder(0)
            .input(Input::Port(port))
            .capture(Arc::clone(&tap))
            .clock(clock)
            .build()
            .unwrap();

        inject(&dev, 0, 3);
        worker.poll_once();
        assert_eq!(worker.stats().snapshot().capture_dropped, 1);
        assert_eq!(dev.pool().in_use(), 2);

        let mut sink = MemoryCapture::new();
        assert_eq!(tap.drain_into(&mut sink, 8).unwrap(), 2);
        assert_eq!(sink.packets()[1].data, vec![1u8; 64]);
        assert_eq!(dev.pool().in_use(), 0);
    }

    #[test]
    fn test_drain_drops_what_cannot_leave() {
        let (dev, clock) = setup(64);
        let input = ring(64);
        let out = ring(2);
        let mut worker = Worker::builder(0)
            .input(Input::Ring(Arc::clone(&input)))
            .output(Output::Ring(Arc::clone(&out)))
            .config(WorkerConfig {
                backpressure: BackpressurePolicy::Retry { max_attempts: 100 },
                drain_attempts: 3,
                ..Default::default()
            })
            .clock(clock)
            .build()
            .unwrap();

        let mut pkts = dev.pool().alloc_bulk(5).unwrap();
        input.enqueue_exact(&mut pkts).unwrap();
        worker.poll_once();
        assert_eq!(worker.tx.len(), 3);

        worker.drain();
        assert!(worker.tx.is_empty());
        assert_eq!(worker.stats().snapshot().tx_dropped, 3);
        assert_eq!(dev.pool().in_use(), 2);
    }

    #[test]
    fn test_drain_empties_input_ring() {
        let (dev, clock) = setup(64);
        let input = ring(64);
        let out = ring(4);
        let worker = Worker::builder(0)
            .input(Input::Ring(Arc::clone(&input)))
            .output(Output::Ring(Arc::clone(&out)))
            .config(WorkerConfig { drain_attempts: 1, ..Default::default() })
            .clock(clock)
            .build()
            .unwrap();

        let mut pkts = dev.pool().alloc_bulk(10).unwrap();
        input.enqueue_exact(&mut pkts).unwrap();
        worker.state_cell().request_stop();
        let snap = worker.run();

        assert!(input.is_empty());
        assert_eq!(out.count(), 4);
        assert_eq!(snap.rx_packets, 10);
        assert_eq!((snap.tx_packets, snap.tx_dropped), (4, 6));
        assert_eq!(dev.pool().in_use(), 4);
    }

    #[test]
    fn test_retry_budget_counts_cycles_not_packets() {
        let (dev, clock) = setup(64);
        let input = ring(64);
        let out = ring(4);
        let mut worker = Worker::builder(0)
            .input(Input::Ring(Arc::clone(&input)))
            .output(Output::Ring(Arc::clone(&out)))
            .config(WorkerConfig {
                burst_size: 8,
                backpressure: BackpressurePolicy::Retry { max_attempts: 3 },
                ..Default::default()
            })
            .clock(clock)
            .build()
            .unwrap();

        let mut pkts = dev.pool().alloc_bulk(16).unwrap();
        input.enqueue_exact(&mut pkts).unwrap();
        worker.poll_once();
        worker.poll_once();
        worker.poll_once();
        assert_eq!(worker.tx.len(), 12);
        assert_eq!(worker.stats().snapshot().tx_dropped, 0);

        worker.poll_once();
        assert_eq!(worker.stats().snapshot().tx_dropped, 12);
        assert_eq!(dev.pool().in_use(), 4);
    }

    #[test]
    fn test_spawned_worker_drains_and_stops() {
        let (dev, _) = setup(256);
        let input = ring(256);
        let out = ring(256);
        let worker = Worker::builder(7)
            .input(Input::Ring(Arc::clone(&input)))
            .output(Output::Ring(Arc::clone(&out)))
            .build()
            .unwrap();
        let handle = worker.spawn().unwrap();

        let mut pkts = dev.pool().alloc_bulk(100).unwrap();
        input.enqueue_exact(&mut pkts).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while out.count() < 100 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        handle.request_stop();
        let snap = handle.join();

        assert_eq!(snap.rx_packets, 100);
        assert_eq!(snap.tx_packets, 100);
        assert_eq!(out.count(), 100);
    }

    #[test]
    fn test_stop_before_start() {
        let worker = Worker::builder(0).input(Input::Ring(ring(8))).build().unwrap();
        let state = worker.state_cell();
        state.request_stop();
        let snap = worker.run();
        assert_eq!(state.load(), WorkerState::Stopped);
        assert_eq!(snap.rx_packets, 0);
    }
}

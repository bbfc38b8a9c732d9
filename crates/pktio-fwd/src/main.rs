//! pktio-fwd - Forwarding Driver
//!
//! Runs RX -> workers -> TX over the software device: frames injected on
//! port 0 have their MAC addresses swapped and leave on port 1.

use anyhow::{bail, Context};
use pktio_dataplane::stats::describe_metrics;
use pktio_dataplane::{
    CorePreference, DataplaneConfig, DeviceManager, Engine, Input, Mbuf, Output, PortId, QueueConfig,
    BufferPool, Ring, SystemAffinity, Verdict, VirtualDevice, Worker, WorkerContext,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const RX_PORT: PortId = PortId::new(0, 0);
const TX_PORT: PortId = PortId::new(1, 0);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("pktio-fwd v{}", env!("CARGO_PKG_VERSION"));

    // Load config
    let config = match std::env::var("PKTIO_CONFIG") {
        Ok(path) => DataplaneConfig::load(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => {
            tracing::warn!("PKTIO_CONFIG not set, using defaults");
            DataplaneConfig::default()
        }
    };
    config.validate()?;
    if config.device.ports < 2 {
        bail!("forwarding needs two ports, config has {}", config.device.ports);
    }

    if let Ok(addr) = std::env::var("PKTIO_METRICS_ADDR") {
        let addr: SocketAddr = addr.parse().with_context(|| format!("bad metrics address {}", addr))?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing prometheus exporter")?;
        describe_metrics();
        tracing::info!(%addr, "prometheus exporter listening");
    }

    let run_for = std::env::var("PKTIO_DURATION_SECS")
        .ok()
        .map(|s| s.parse::<u64>().map(Duration::from_secs))
        .transpose()
        .context("PKTIO_DURATION_SECS")?;

    // Data plane
    let pool = BufferPool::new("pktio-fwd", &config.pool)?;
    let device = VirtualDevice::new(pool.clone(), &config.device)?;
    let queue = QueueConfig { queue: 0, rx_desc: config.device.rx_desc, tx_desc: config.device.tx_desc };
    let rx_port = device.open_port(RX_PORT.device, &queue)?;
    let tx_port = device.open_port(TX_PORT.device, &queue)?;
    let rx_ring = Arc::new(Ring::<Mbuf>::new("rx", config.ring_capacity)?);
    let tx_ring = Arc::new(Ring::<Mbuf>::new("tx", config.ring_capacity)?);
    let devices: Arc<dyn DeviceManager> = Arc::new(device.clone());

    let mut engine = Engine::new(&config, Arc::new(SystemAffinity::new()));

    let rx_worker = Worker::builder(0)
        .input(Input::Port(rx_port))
        .output(Output::Ring(Arc::clone(&rx_ring)))
        .config(config.worker.clone())
        .device_errors(Arc::clone(&devices))
        .build()?;
    engine.spawn(rx_worker, CorePreference::Any).context("starting rx worker")?;

    for id in 1..=config.workers {
        let worker = Worker::builder(id)
            .input(Input::Ring(Arc::clone(&rx_ring)))
            .output(Output::Ring(Arc::clone(&tx_ring)))
            .processor(swap_macs)
            .config(config.worker.clone())
            .build()?;
        engine.spawn(worker, CorePreference::Any).with_context(|| format!("starting worker {}", id))?;
    }

    let tx_worker = Worker::builder(config.workers + 1)
        .input(Input::Ring(Arc::clone(&tx_ring)))
        .output(Output::Port(tx_port))
        .config(config.worker.clone())
        .device_errors(Arc::clone(&devices))
        .build()?;
    engine.spawn(tx_worker, CorePreference::Any).context("starting tx worker")?;

    tracing::info!(workers = engine.len(), "pipeline running");

    // Traffic
    let running = Arc::new(AtomicBool::new(true));
    let wire = {
        let device = device.clone();
        let running = Arc::clone(&running);
        thread::Builder::new()
            .name("pktio-wire".into())
            .spawn(move || run_wire(device, running))?
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let deadline = async {
        match run_for {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = engine.stats();
                let mpps = stats.packet_rate_mpps(engine.elapsed_secs());
                tracing::info!(
                    rx = stats.rx_packets,
                    tx = stats.tx_packets,
                    dropped = stats.dropped + stats.tx_dropped,
                    mpps,
                    buffers_in_use = pool.in_use(),
                    "stats"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            _ = &mut deadline => break,
        }
    }

    // Shutdown: stop the wire first so the workers can drain
    running.store(false, Ordering::Release);
    let (injected, transmitted) = wire
        .join()
        .map_err(|_| anyhow::anyhow!("wire thread panicked"))?;
    let elapsed = engine.elapsed_secs();
    let finals = engine.stop();

    let total = engine.stats();
    println!("workers:       {}", finals.len());
    println!("injected:      {}", injected);
    println!("transmitted:   {}", transmitted);
    println!("rx packets:    {}", total.rx_packets);
    println!("tx packets:    {}", total.tx_packets);
    println!("dropped:       {}", total.dropped + total.tx_dropped);
    println!("device errors: {}", total.device_errors);
    println!("alarms:        {}", total.alarms);
    println!("rate:          {:.3} Mpps", total.packet_rate_mpps(elapsed));
    println!("throughput:    {:.3} Gbps", total.throughput_gbps(elapsed));

    Ok(())
}

/// Swap destination and source MAC addresses
fn swap_macs(pkt: &mut Mbuf, _ctx: &WorkerContext) -> Verdict {
    match pkt.data_mut() {
        Some(frame) if frame.len() >= 12 => {
            let (dst, rest) = frame.split_at_mut(6);
            dst.swap_with_slice(&mut rest[..6]);
            Verdict::Forward
        }
        _ => Verdict::Drop,
    }
}

/// Feed port 0 and empty port 1 until told to stop
fn run_wire(device: VirtualDevice, running: Arc<AtomicBool>) -> (u64, u64) {
    let mut frame = [0u8; 64];
    frame[..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());

    let mut injected = 0u64;
    let mut transmitted = 0u64;
    let mut out = Vec::with_capacity(256);

    while running.load(Ordering::Acquire) {
        for _ in 0..pktio_dataplane::BURST_SIZE {
            match device.inject(RX_PORT, &frame) {
                Ok(true) => injected += 1,
                Ok(false) => break,
                Err(e) => {
                    tracing::error!(error = %e, "inject failed");
                    return (injected, transmitted);
                }
            }
        }

        match device.drain_tx(TX_PORT, &mut out, 256) {
            Ok(n) => transmitted += n as u64,
            Err(e) => tracing::warn!(error = %e, "drain failed"),
        }
        out.clear();
        thread::yield_now();
    }

    (injected, transmitted)
}

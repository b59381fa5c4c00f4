//! # oya-pprof - profiling demo binary
//!
//! Runs a synthetic workload under one profiling session and prints the path
//! of the artifact it wrote.
//!
//! The session stops when `--duration-ms` elapses or on Ctrl+C, whichever
//! comes first. Any error halts the binary with the full error chain and a
//! non-zero exit code.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, info_span, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use oya_pprof::{ProfiledMutex, Profiler, TraceLayer, TrackingAllocator, track_blocking};

use crate::cli::Cli;

#[global_allocator]
static ALLOC: TrackingAllocator = TrackingAllocator::system();

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.to_config()?;

    let profiler = Profiler::start(config).context("Failed to start profiling session")?;
    let workload = Workload::spawn(cli.workers).context("Failed to spawn workload")?;

    wait_for_stop(Duration::from_millis(cli.duration_ms)).await;

    workload.stop();
    let artifact = profiler
        .stop()
        .context("Failed to stop profiling session")?;

    match artifact {
        Some(path) => println!("{}", path.display()),
        None => info!("profiling disabled, no artifact written"),
    }
    Ok(())
}

/// Initialize tracing subscriber with environment filter and the trace layer.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(TraceLayer::new())
        .init();
}

async fn wait_for_stop(duration: Duration) {
    if duration.is_zero() {
        wait_for_shutdown().await;
        return;
    }
    tokio::select! {
        () = tokio::time::sleep(duration) => info!(?duration, "workload duration elapsed"),
        () = wait_for_shutdown() => {}
    }
}

async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, stopping"),
        Err(err) => {
            error!("Failed to listen for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
    }
}

/// Worker threads exercising every kind of instrumentation.
struct Workload {
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<u64>>,
}

impl Workload {
    fn spawn(count: usize) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let shared = Arc::new(ProfiledMutex::new(Vec::<u64>::new()));

        let workers = (0..count.max(1))
            .map(|id| {
                let running = Arc::clone(&running);
                let shared = Arc::clone(&shared);
                oya_pprof::spawn(format!("workload-{id}"), move || {
                    work(id, &running, &shared)
                })
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Self { running, workers })
    }

    fn stop(self) {
        self.running.store(false, Ordering::Release);
        let total: u64 = self
            .workers
            .into_iter()
            .filter_map(|worker| match worker.join() {
                Ok(iterations) => Some(iterations),
                Err(_) => {
                    warn!("workload thread panicked");
                    None
                }
            })
            .sum();
        info!(iterations = total, "workload stopped");
    }
}

fn work(id: usize, running: &AtomicBool, shared: &ProfiledMutex<Vec<u64>>) -> u64 {
    let mut iterations = 0_u64;
    while running.load(Ordering::Acquire) {
        let _span = info_span!("iteration", worker = id, n = iterations).entered();

        // hold the lock long enough for the other workers to queue up
        {
            let mut values = shared.lock();
            values.push(iterations);
            if values.len() > 1024 {
                values.clear();
            }
            thread::sleep(Duration::from_micros(200));
        }

        let buffer: Vec<u8> = vec![0; 4096_usize.saturating_mul(id.saturating_add(1))];
        let checksum = buffer.iter().map(|b| u64::from(*b)).sum::<u64>();

        track_blocking(|| thread::sleep(Duration::from_millis(1)));

        let burn = (0..10_000_u64).fold(checksum, |acc, x| acc.wrapping_mul(31).wrapping_add(x));
        tracing::trace!(worker = id, burn, "iteration done");

        iterations = iterations.wrapping_add(1);
    }
    iterations
}

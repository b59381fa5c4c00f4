//! Wall-clock sampler: a background thread that periodically records the
//! state of every other thread in the process, whether on or off CPU.
//!
//! Each tick records a `state;name` pair per thread, not the thread's call
//! stack: a two-frame sample with the scheduler state as leaf and the thread
//! name as root (folded as `worker-3;sleeping`). Reading another thread's
//! stack would need signal-based unwinding.

use std::collections::HashMap;
use std::io::Write;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::Capture;
use super::threads::{self, ThreadInfo};
use crate::config::SamplerFormat;
use crate::encode;
use crate::error::{ProfilerError, Result};
use crate::profile::{Profile, ValueType};
use crate::sink::OutputSink;

/// Interval between samples (about 99 Hz).
pub const SAMPLE_INTERVAL: Duration = Duration::from_micros(10_101);

const MODE: &str = "sampling_profiler";

/// Aggregated samples keyed by stack (leaf first).
#[derive(Debug, Default)]
struct Samples {
    stacks: HashMap<Vec<String>, Vec<i64>>,
    ticks: u64,
    failed_ticks: u64,
}

impl Samples {
    fn record(&mut self, threads: Vec<ThreadInfo>, own_tid: Option<u64>, interval_ns: i64) {
        self.ticks = self.ticks.saturating_add(1);
        for info in threads.into_iter().filter(|t| Some(t.tid) != own_tid) {
            let values = self
                .stacks
                .entry(vec![info.state.as_str().to_owned(), info.name])
                .or_insert_with(|| vec![0, 0]);
            if let [count, time] = values.as_mut_slice() {
                *count = count.saturating_add(1);
                *time = time.saturating_add(interval_ns);
            }
        }
    }

    fn into_profile(self, interval_ns: i64, duration: Duration) -> Profile {
        Profile::from_stacks(
            MODE,
            vec![
                ValueType::new("samples", "count"),
                ValueType::new("time", "nanoseconds"),
            ],
            self.stacks,
        )
        .with_period(ValueType::new("wallclock", "nanoseconds"), interval_ns)
        .with_duration(duration)
    }
}

#[cfg(target_os = "linux")]
fn own_tid() -> Option<u64> {
    std::fs::read_to_string("/proc/thread-self/stat")
        .ok()
        .as_deref()
        .and_then(threads::parse_task_stat)
        .map(|info| info.tid)
}

#[cfg(not(target_os = "linux"))]
const fn own_tid() -> Option<u64> {
    None
}

fn write_profile(sink: &mut OutputSink, profile: &Profile, format: SamplerFormat) -> Result<()> {
    let written = match format {
        SamplerFormat::Binary => sink.write_all(&encode::to_pprof(profile)),
        SamplerFormat::Folded => profile.write_folded(sink),
    };
    written
        .and_then(|()| sink.flush())
        .map_err(|e| ProfilerError::flush(MODE, e.to_string()))
}

fn run(stop: &mpsc::Receiver<()>, format: SamplerFormat, mut sink: OutputSink) -> Result<OutputSink> {
    let started = Instant::now();
    let interval_ns = i64::try_from(SAMPLE_INTERVAL.as_nanos()).unwrap_or(i64::MAX);
    let own = own_tid();
    let mut samples = Samples::default();

    loop {
        match stop.recv_timeout(SAMPLE_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => match threads::live_threads() {
                Ok(threads) => samples.record(threads, own, interval_ns),
                Err(_) => samples.failed_ticks = samples.failed_ticks.saturating_add(1),
            },
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if samples.failed_ticks > 0 {
        warn!(
            failed = samples.failed_ticks,
            "sampler could not list threads on some ticks"
        );
    }
    debug!(ticks = samples.ticks, "sampler stopped");

    let profile = samples.into_profile(interval_ns, started.elapsed());
    write_profile(&mut sink, &profile, format)?;
    Ok(sink)
}

/// Background sampler thread plus its stop channel.
///
/// The thread owns the sink until [`Capture::finish`] joins it. Samples are
/// `state;name` pairs (`[state, name]`, leaf first), one per sampled thread.
/// They show where wall time went per thread and scheduler state, not which
/// code ran.
#[derive(Debug)]
pub struct SamplerHandle {
    stop: Sender<()>,
    worker: JoinHandle<Result<OutputSink>>,
}

impl SamplerHandle {
    /// Spawn the sampler thread.
    ///
    /// # Errors
    ///
    /// Returns [`ProfilerError::Instrumentation`] if the thread cannot be
    /// spawned.
    pub fn start(format: SamplerFormat, sink: OutputSink) -> Result<Self> {
        let (stop, stop_rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("oya-pprof-sampler".to_owned())
            .spawn(move || run(&stop_rx, format, sink))
            .map_err(|e| ProfilerError::instrumentation(MODE, format!("spawning sampler: {e}")))?;

        debug!(%format, interval_us = SAMPLE_INTERVAL.as_micros(), "sampler started");
        Ok(Self { stop, worker })
    }
}

impl Capture for SamplerHandle {
    fn finish(self: Box<Self>) -> Result<OutputSink> {
        // a closed channel also stops the loop, so a failed send is harmless
        let _ = self.stop.send(());
        self.worker
            .join()
            .map_err(|_| ProfilerError::flush(MODE, "sampler thread panicked"))
            .and_then(|result| result)
    }
}

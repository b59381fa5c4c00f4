//! CPU profile: timer-signal stack sampling through the `pprof` crate.
//!
//! Only one CPU capture may run per process; the signal handler and its
//! sample buffer are process-wide.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ProfilerError, Result};

/// Sampling frequency of the CPU timer.
pub const SAMPLE_HZ: i32 = 99;

const NANOS_PER_SEC: i64 = 1_000_000_000;

static CPU_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Nanoseconds of CPU time one sample stands for.
fn sample_period_ns() -> i64 {
    NANOS_PER_SEC
        .checked_div(i64::from(SAMPLE_HZ))
        .unwrap_or(NANOS_PER_SEC)
}

/// Exclusive claim on the process-wide CPU sampler, released on drop.
#[derive(Debug)]
struct ActiveClaim;

impl ActiveClaim {
    fn acquire() -> Result<Self> {
        CPU_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| Self)
            .map_err(|_| ProfilerError::already_active("cpu"))
    }
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        CPU_ACTIVE.store(false, Ordering::SeqCst);
    }
}

pub use imp::CpuCapture;

#[cfg(unix)]
mod imp {
    use std::io::Write;
    use std::time::Instant;

    use pprof::{ProfilerGuard, ProfilerGuardBuilder};
    use tracing::debug;

    use super::{ActiveClaim, SAMPLE_HZ, sample_period_ns};
    use crate::encode;
    use crate::error::{ProfilerError, Result};
    use crate::profile::{Profile, ValueType};
    use crate::runtime::Capture;
    use crate::sink::OutputSink;

    /// Shared objects whose frames only add noise to the profile.
    const BLOCKLIST: &[&str] = &["libc", "libgcc", "pthread", "vdso"];

    /// Running CPU capture. Samples are buffered by the signal handler and
    /// written into the sink when the capture finishes.
    pub struct CpuCapture {
        guard: ProfilerGuard<'static>,
        sink: OutputSink,
        started: Instant,
        _claim: ActiveClaim,
    }

    impl CpuCapture {
        /// Arm the CPU sampler.
        ///
        /// # Errors
        ///
        /// Returns [`ProfilerError::AlreadyActive`] when another CPU capture is
        /// running and [`ProfilerError::Instrumentation`] when the timer cannot
        /// be armed.
        pub fn start(sink: OutputSink) -> Result<Self> {
            let claim = ActiveClaim::acquire()?;
            let guard = ProfilerGuardBuilder::default()
                .frequency(SAMPLE_HZ)
                .blocklist(BLOCKLIST)
                .build()
                .map_err(|e| ProfilerError::instrumentation("cpu", e.to_string()))?;

            debug!(frequency = SAMPLE_HZ, "cpu sampler armed");

            Ok(Self {
                guard,
                sink,
                started: Instant::now(),
                _claim: claim,
            })
        }
    }

    impl Capture for CpuCapture {
        fn finish(self: Box<Self>) -> Result<OutputSink> {
            let Self {
                guard,
                mut sink,
                started,
                _claim,
            } = *self;

            let report = guard
                .report()
                .build()
                .map_err(|e| ProfilerError::flush("cpu", format!("building report: {e}")))?;
            drop(guard);

            let period_ns = sample_period_ns();
            let mut profile = Profile::new(
                "cpu",
                vec![
                    ValueType::new("samples", "count"),
                    ValueType::new("cpu", "nanoseconds"),
                ],
            )
            .with_period(ValueType::new("cpu", "nanoseconds"), period_ns)
            .with_duration(started.elapsed());

            for (frames, count) in &report.data {
                let mut stack: Vec<String> = frames
                    .frames
                    .iter()
                    .flat_map(|symbols| symbols.iter().map(|symbol| symbol.name()))
                    .collect();
                stack.push(frames.thread_name.clone());

                let count = i64::try_from(*count).unwrap_or(i64::MAX);
                profile.add(stack, vec![count, count.saturating_mul(period_ns)]);
            }

            debug!(stacks = profile.samples().len(), "cpu samples collected");

            sink.write_all(&encode::to_pprof(&profile))
                .and_then(|()| sink.flush())
                .map_err(|e| ProfilerError::flush("cpu", e.to_string()))?;

            Ok(sink)
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use crate::error::{ProfilerError, Result};
    use crate::runtime::Capture;
    use crate::sink::OutputSink;

    /// CPU sampling needs timer signals, which this platform lacks.
    #[derive(Debug)]
    pub struct CpuCapture;

    impl CpuCapture {
        /// # Errors
        ///
        /// Always returns [`ProfilerError::Unsupported`].
        pub fn start(_sink: OutputSink) -> Result<Self> {
            Err(ProfilerError::unsupported("cpu", "timer signals are unavailable"))
        }
    }

    impl Capture for CpuCapture {
        fn finish(self: Box<Self>) -> Result<OutputSink> {
            Err(ProfilerError::unsupported("cpu", "timer signals are unavailable"))
        }
    }
}

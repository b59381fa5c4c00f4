//! Process-wide instrumentation behind the profiling modes.
//!
//! The dispatcher only talks to [`Instrumentation`]. [`ProcessInstrumentation`]
//! wires it to the real hooks in this module; tests substitute a recording
//! double.

pub mod contention;
pub mod cpu;
pub mod heap;
pub mod sampler;
pub mod threads;
pub mod trace;

use std::fmt;

use crate::config::SamplerFormat;
use crate::error::Result;
use crate::profile::Profile;
use crate::sink::OutputSink;

/// Captures that stream into the sink for the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Cpu,
    Trace,
}

impl StreamKind {
    /// Mode name of the capture
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Trace => "trace",
        }
    }
}

/// Process-wide sampling knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateToggle {
    /// One in N contended mutex acquisitions is recorded.
    Mutex,
    /// Blocking events are recorded at one per N nanoseconds blocked.
    Block,
}

impl RateToggle {
    /// Snapshot taken after the toggle is reset
    #[must_use]
    pub const fn snapshot(self) -> SnapshotKind {
        match self {
            Self::Mutex => SnapshotKind::Mutex,
            Self::Block => SnapshotKind::Block,
        }
    }
}

/// Named point-in-time profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotKind {
    Heap,
    Allocs,
    Mutex,
    Block,
    ThreadCreate,
    Goroutine,
}

impl SnapshotKind {
    /// Profile name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Heap => "heap",
            Self::Allocs => "allocs",
            Self::Mutex => "mutex",
            Self::Block => "block",
            Self::ThreadCreate => "thread_create",
            Self::Goroutine => "goroutine",
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running capture that owns the sink until it is finished.
pub trait Capture: Send {
    /// Stop capturing, write any buffered data and hand the sink back.
    ///
    /// On error the sink is dropped, which closes the file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ProfilerError::Flush`] when collected data cannot be
    /// written.
    fn finish(self: Box<Self>) -> Result<OutputSink>;
}

/// Runtime hooks used by the mode dispatcher.
pub trait Instrumentation: Send + Sync {
    /// Start a streaming capture writing into `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ProfilerError::AlreadyActive`] if a capture of the same
    /// kind is running, or an instrumentation error if it cannot be armed.
    fn start_stream(&self, kind: StreamKind, sink: OutputSink) -> Result<Box<dyn Capture>>;

    /// Register an owner of a process-wide rate and raise it to `value`.
    fn enable_rate(&self, toggle: RateToggle, value: u64);

    /// Release an owner of a process-wide rate; the last owner resets it to zero.
    fn disable_rate(&self, toggle: RateToggle);

    /// Take a named snapshot of accumulated or live state.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying state cannot be read.
    fn snapshot(&self, kind: SnapshotKind) -> Result<Profile>;

    /// Start the wall-clock sampler thread writing into `sink`.
    ///
    /// # Errors
    ///
    /// Returns an instrumentation error if the thread cannot be spawned.
    fn start_sampler(&self, format: SamplerFormat, sink: OutputSink) -> Result<Box<dyn Capture>>;
}

/// The real, process-wide hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessInstrumentation;

impl Instrumentation for ProcessInstrumentation {
    fn start_stream(&self, kind: StreamKind, sink: OutputSink) -> Result<Box<dyn Capture>> {
        match kind {
            StreamKind::Cpu => Ok(Box::new(cpu::CpuCapture::start(sink)?)),
            StreamKind::Trace => Ok(Box::new(trace::TraceCapture::start(sink)?)),
        }
    }

    fn enable_rate(&self, toggle: RateToggle, value: u64) {
        contention::toggle(toggle).acquire(value);
    }

    fn disable_rate(&self, toggle: RateToggle) {
        contention::toggle(toggle).release();
    }

    fn snapshot(&self, kind: SnapshotKind) -> Result<Profile> {
        match kind {
            SnapshotKind::Heap => Ok(heap::heap_profile()),
            SnapshotKind::Allocs => Ok(heap::allocs_profile()),
            SnapshotKind::Mutex => Ok(contention::mutex_profile()),
            SnapshotKind::Block => Ok(contention::block_profile()),
            SnapshotKind::ThreadCreate => Ok(threads::thread_create_profile()),
            SnapshotKind::Goroutine => threads::live_threads_profile(),
        }
    }

    fn start_sampler(&self, format: SamplerFormat, sink: OutputSink) -> Result<Box<dyn Capture>> {
        Ok(Box::new(sampler::SamplerHandle::start(format, sink)?))
    }
}

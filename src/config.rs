//! Profiling session configuration and its resolution into a validated form.
//!
//! [`Config`] is what callers build (in code, from TOML, or from CLI flags).
//! [`Config::resolve`] applies every default and validates the mode, producing
//! an immutable [`ResolvedConfig`] that the session consumes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProfilerError, Result};
use crate::runtime::{RateToggle, SnapshotKind, StreamKind};

/// Default fraction of mutex contention events that are sampled (1 in N).
pub const DEFAULT_MUTEX_PROFILE_FRACTION: u32 = 10;

/// Default block profile rate in nanoseconds of blocking per sampled event.
pub const DEFAULT_BLOCK_PROFILE_RATE: u64 = 10_000;

/// Kind of profiling data captured by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Processor time, sampled by a timer signal.
    Cpu,
    /// Execution trace of spans and events.
    Trace,
    /// Live heap usage at the moment of the snapshot.
    Heap,
    /// Cumulative allocations since process start.
    Allocs,
    /// Lock contention on profiled mutexes.
    Mutex,
    /// Time spent blocked on synchronization.
    Block,
    /// Stacks that created threads.
    ThreadCreate,
    /// Live threads of the process.
    Goroutine,
    /// Wall-clock sampling of every thread, on and off CPU.
    ///
    /// Records one `state;name` pair per thread per tick rather than call
    /// stacks.
    SamplingProfiler,
}

impl Mode {
    /// Every recognized mode.
    pub const ALL: [Self; 9] = [
        Self::Cpu,
        Self::Trace,
        Self::Heap,
        Self::Allocs,
        Self::Mutex,
        Self::Block,
        Self::ThreadCreate,
        Self::Goroutine,
        Self::SamplingProfiler,
    ];

    /// Canonical name, used in artifact file names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Trace => "trace",
            Self::Heap => "heap",
            Self::Allocs => "allocs",
            Self::Mutex => "mutex",
            Self::Block => "block",
            Self::ThreadCreate => "thread_create",
            Self::Goroutine => "goroutine",
            Self::SamplingProfiler => "sampling_profiler",
        }
    }

    /// Collection strategy used for this mode.
    #[must_use]
    pub const fn strategy(self) -> Strategy {
        match self {
            Self::Cpu => Strategy::Stream(StreamKind::Cpu),
            Self::Trace => Strategy::Stream(StreamKind::Trace),
            Self::Mutex => Strategy::Toggle(RateToggle::Mutex),
            Self::Block => Strategy::Toggle(RateToggle::Block),
            Self::Heap => Strategy::Snapshot(SnapshotKind::Heap),
            Self::Allocs => Strategy::Snapshot(SnapshotKind::Allocs),
            Self::ThreadCreate => Strategy::Snapshot(SnapshotKind::ThreadCreate),
            Self::Goroutine => Strategy::Snapshot(SnapshotKind::Goroutine),
            Self::SamplingProfiler => Strategy::Sampler,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ProfilerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "trace" => Ok(Self::Trace),
            "heap" => Ok(Self::Heap),
            "allocs" => Ok(Self::Allocs),
            "mutex" => Ok(Self::Mutex),
            "block" => Ok(Self::Block),
            "thread_create" | "threadcreate" => Ok(Self::ThreadCreate),
            "goroutine" => Ok(Self::Goroutine),
            "sampling_profiler" | "fgprof" => Ok(Self::SamplingProfiler),
            other => Err(ProfilerError::invalid_mode(other)),
        }
    }
}

/// How a mode collects its data.
///
/// The set is closed: the dispatcher matches on it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// A capture streams into the sink for the whole session.
    Stream(StreamKind),
    /// A process-wide rate is raised at start and reset at stop, then snapshotted.
    Toggle(RateToggle),
    /// Nothing happens at start; live state is snapshotted at stop.
    Snapshot(SnapshotKind),
    /// A background sampler thread owns the sink until stopped.
    Sampler,
}

/// Output encoding of the wall-clock sampler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerFormat {
    /// pprof protobuf.
    #[default]
    #[serde(alias = "pprof")]
    Binary,
    /// Folded stacks, one `a;b;c count` line per stack.
    Folded,
}

impl fmt::Display for SamplerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => f.write_str("binary"),
            Self::Folded => f.write_str("folded"),
        }
    }
}

impl FromStr for SamplerFormat {
    type Err = ProfilerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "binary" | "pprof" => Ok(Self::Binary),
            "folded" => Ok(Self::Folded),
            other => Err(ProfilerError::invalid_config(format!(
                "unknown sampling profiler format '{other}'"
            ))),
        }
    }
}

/// Caller-supplied profiling configuration.
///
/// Zero and empty values mean "use the default"; see [`Config::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Turn the whole session into a no-op.
    pub disabled: bool,

    /// One of the [`Mode`] names. Empty means `cpu`.
    pub mode: String,

    /// Directory receiving the artifact. Empty means `.`.
    pub output_dir: PathBuf,

    /// Optional prefix prepended to the artifact file name.
    pub file_prefix: Option<String>,

    /// Render snapshot profiles as text instead of pprof protobuf.
    pub use_text_format: bool,

    /// Sample one in N contended mutex acquisitions. Zero means 10.
    pub mutex_profile_fraction: u32,

    /// Nanoseconds of blocking per sampled block event. Zero means 10000.
    pub block_profile_rate: u64,

    /// Encoding of the sampling profiler output. Unset means binary.
    pub sampling_profiler_format: Option<SamplerFormat>,
}

impl Config {
    /// Create a configuration for the given mode, everything else defaulted.
    #[must_use]
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            ..Self::default()
        }
    }

    /// Parse a configuration from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ProfilerError::InvalidConfig`] if the document is not valid
    /// TOML or has fields of the wrong type.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| ProfilerError::invalid_config(e.to_string()))
    }

    /// Set the profiling mode.
    #[must_use]
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    /// Set the output directory.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Set the artifact file prefix.
    #[must_use]
    pub fn with_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = Some(prefix.into());
        self
    }

    /// Render snapshot profiles as text.
    #[must_use]
    pub const fn with_text_format(mut self, use_text_format: bool) -> Self {
        self.use_text_format = use_text_format;
        self
    }

    /// Set the mutex contention sampling fraction.
    #[must_use]
    pub const fn with_mutex_profile_fraction(mut self, fraction: u32) -> Self {
        self.mutex_profile_fraction = fraction;
        self
    }

    /// Set the block profile rate.
    #[must_use]
    pub const fn with_block_profile_rate(mut self, rate: u64) -> Self {
        self.block_profile_rate = rate;
        self
    }

    /// Set the sampling profiler output format.
    #[must_use]
    pub const fn with_sampling_profiler_format(mut self, format: SamplerFormat) -> Self {
        self.sampling_profiler_format = Some(format);
        self
    }

    /// Disable or enable the session.
    #[must_use]
    pub const fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Apply defaults and validate.
    ///
    /// # Errors
    ///
    /// Returns [`ProfilerError::InvalidMode`] carrying the offending string,
    /// unmodified, when the mode is not one of the recognized names. Names are
    /// matched exactly; surrounding whitespace is not stripped.
    pub fn resolve(self) -> Result<ResolvedConfig> {
        let mode = if self.mode.is_empty() {
            Mode::Cpu
        } else {
            self.mode.parse()?
        };

        let output_dir = if self.output_dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            self.output_dir
        };

        let file_prefix = self.file_prefix.filter(|prefix| !prefix.is_empty());

        let mutex_profile_fraction = match self.mutex_profile_fraction {
            0 => DEFAULT_MUTEX_PROFILE_FRACTION,
            fraction => fraction,
        };

        let block_profile_rate = match self.block_profile_rate {
            0 => DEFAULT_BLOCK_PROFILE_RATE,
            rate => rate,
        };

        Ok(ResolvedConfig {
            disabled: self.disabled,
            mode,
            output_dir,
            file_prefix,
            use_text_format: self.use_text_format,
            mutex_profile_fraction,
            block_profile_rate,
            sampling_profiler_format: self.sampling_profiler_format.unwrap_or_default(),
        })
    }
}

/// Fully defaulted, validated configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedConfig {
    disabled: bool,
    mode: Mode,
    output_dir: PathBuf,
    file_prefix: Option<String>,
    use_text_format: bool,
    mutex_profile_fraction: u32,
    block_profile_rate: u64,
    sampling_profiler_format: SamplerFormat,
}

impl ResolvedConfig {
    /// Whether the session is a no-op.
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Get the profiling mode
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Get the output directory
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Get the artifact file prefix (never empty)
    #[must_use]
    pub fn file_prefix(&self) -> Option<&str> {
        self.file_prefix.as_deref()
    }

    /// Whether snapshot profiles are rendered as text
    #[must_use]
    pub const fn use_text_format(&self) -> bool {
        self.use_text_format
    }

    /// Get the mutex contention sampling fraction
    #[must_use]
    pub const fn mutex_profile_fraction(&self) -> u32 {
        self.mutex_profile_fraction
    }

    /// Get the block profile rate in nanoseconds
    #[must_use]
    pub const fn block_profile_rate(&self) -> u64 {
        self.block_profile_rate
    }

    /// Get the sampling profiler output format
    #[must_use]
    pub const fn sampling_profiler_format(&self) -> SamplerFormat {
        self.sampling_profiler_format
    }

    /// Extension of the artifact this configuration produces.
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self.mode.strategy() {
            Strategy::Stream(StreamKind::Trace) => "trace",
            Strategy::Stream(StreamKind::Cpu) => "pprof",
            Strategy::Toggle(_) | Strategy::Snapshot(_) => {
                if self.use_text_format {
                    "txt"
                } else {
                    "pprof"
                }
            }
            Strategy::Sampler => match self.sampling_profiler_format {
                SamplerFormat::Binary => "pprof",
                SamplerFormat::Folded => "txt",
            },
        }
    }
}

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # oya-pprof
//!
//! Profiling sessions for a running process: pick a mode, start a session,
//! stop it, and get one artifact file per session.
//!
//! ```no_run
//! use oya_pprof::{Config, Profiler};
//!
//! let profiler = Profiler::start(Config::new("mutex").with_output_dir("profiles"))?;
//! // ... workload ...
//! if let Some(path) = profiler.stop()? {
//!     println!("wrote {}", path.display());
//! }
//! # Ok::<(), oya_pprof::ProfilerError>(())
//! ```
//!
//! Modes that need process hooks rely on the host wiring them in:
//! [`TrackingAllocator`] for `heap`/`allocs`, [`ProfiledMutex`] and
//! [`track_blocking`] for `mutex`/`block`, [`spawn`] for `thread_create`, and
//! [`TraceLayer`] for `trace`.

pub mod config;
pub mod dispatch;
pub mod encode;
pub mod error;
pub mod profile;
pub mod profiler;
pub mod runtime;
pub mod sink;
pub mod stack;

pub use config::{Config, Mode, ResolvedConfig, SamplerFormat, Strategy};
pub use error::{ProfilerError, Result};
pub use profile::Profile;
pub use profiler::{Profiler, run};
pub use runtime::contention::{
    ProfiledMutex, block_profile_rate, mutex_profile_fraction, track_blocking,
};
pub use runtime::heap::TrackingAllocator;
pub use runtime::threads::spawn;
pub use runtime::trace::TraceLayer;
pub use runtime::{Instrumentation, ProcessInstrumentation};
pub use sink::OutputSink;

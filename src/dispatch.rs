//! Mode dispatcher: starts the instrumentation for a mode and, at stop,
//! collects and serializes what it captured.
//!
//! Each [`Strategy`] has its own start/stop pair; the match over strategies
//! is exhaustive, so adding a mode forces a decision here.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::{Mode, ResolvedConfig, Strategy};
use crate::encode;
use crate::error::{ProfilerError, Result};
use crate::profile::Profile;
use crate::runtime::{Capture, Instrumentation, RateToggle, SnapshotKind, StreamKind};
use crate::sink::OutputSink;

/// Instrumentation armed for a session, owning its sink.
pub enum Running {
    /// A capture streaming into the sink it owns.
    Stream {
        kind: StreamKind,
        capture: Box<dyn Capture>,
    },
    /// A raised process-wide rate, snapshotted into the sink at stop.
    Toggle {
        toggle: RateToggle,
        sink: OutputSink,
        text: bool,
    },
    /// Nothing armed; live state is snapshotted into the sink at stop.
    Snapshot {
        kind: SnapshotKind,
        sink: OutputSink,
        text: bool,
    },
    /// The background sampler, owning the sink until joined.
    Sampler { capture: Box<dyn Capture> },
}

impl std::fmt::Debug for Running {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream { kind, .. } => f.debug_struct("Stream").field("kind", kind).finish(),
            Self::Toggle { toggle, sink, text } => f
                .debug_struct("Toggle")
                .field("toggle", toggle)
                .field("path", &sink.path())
                .field("text", text)
                .finish(),
            Self::Snapshot { kind, sink, text } => f
                .debug_struct("Snapshot")
                .field("kind", kind)
                .field("path", &sink.path())
                .field("text", text)
                .finish(),
            Self::Sampler { .. } => f.debug_struct("Sampler").finish_non_exhaustive(),
        }
    }
}

/// Starts and stops the instrumentation matching a mode.
#[derive(Clone)]
pub struct Dispatcher {
    instrumentation: Arc<dyn Instrumentation>,
}

impl Dispatcher {
    /// Create a dispatcher over the given instrumentation
    #[must_use]
    pub fn new(instrumentation: Arc<dyn Instrumentation>) -> Self {
        Self { instrumentation }
    }

    /// Arm the instrumentation for the configured mode.
    ///
    /// # Errors
    ///
    /// Returns [`ProfilerError::AlreadyActive`] when a streaming capture of
    /// the same kind is already running, or any instrumentation start error.
    pub fn start(&self, config: &ResolvedConfig, sink: OutputSink) -> Result<Running> {
        let running = match config.mode().strategy() {
            Strategy::Stream(kind) => Running::Stream {
                kind,
                capture: self.instrumentation.start_stream(kind, sink)?,
            },
            Strategy::Toggle(toggle) => {
                let value = match toggle {
                    RateToggle::Mutex => u64::from(config.mutex_profile_fraction()),
                    RateToggle::Block => config.block_profile_rate(),
                };
                self.instrumentation.enable_rate(toggle, value);
                Running::Toggle {
                    toggle,
                    sink,
                    text: config.use_text_format(),
                }
            }
            Strategy::Snapshot(kind) => Running::Snapshot {
                kind,
                sink,
                text: config.use_text_format(),
            },
            Strategy::Sampler => Running::Sampler {
                capture: self
                    .instrumentation
                    .start_sampler(config.sampling_profiler_format(), sink)?,
            },
        };

        debug!(mode = %config.mode(), ?running, "instrumentation armed");
        Ok(running)
    }

    /// Halt the instrumentation, write the collected data and close the sink.
    ///
    /// The sink is closed even when writing fails; the write error wins.
    ///
    /// # Errors
    ///
    /// Returns [`ProfilerError::Flush`] when collected data cannot be
    /// serialized or written, and [`ProfilerError::SinkClose`] when the file
    /// cannot be closed.
    pub fn stop(&self, mode: Mode, running: Running) -> Result<PathBuf> {
        let sink = match running {
            Running::Stream { capture, .. } | Running::Sampler { capture } => capture.finish()?,
            Running::Toggle { toggle, sink, text } => {
                self.instrumentation.disable_rate(toggle);
                self.write_snapshot(mode, toggle.snapshot(), sink, text)?
            }
            Running::Snapshot { kind, sink, text } => self.write_snapshot(mode, kind, sink, text)?,
        };
        sink.close()
    }

    fn write_snapshot(
        &self,
        mode: Mode,
        kind: SnapshotKind,
        mut sink: OutputSink,
        text: bool,
    ) -> Result<OutputSink> {
        let written = self
            .instrumentation
            .snapshot(kind)
            .and_then(|profile| serialize(mode, &profile, &mut sink, text));

        match written {
            Ok(()) => Ok(sink),
            Err(err) => {
                if let Err(close_err) = sink.close() {
                    warn!(%mode, error = %close_err, "failed to close profile output after flush error");
                }
                Err(err)
            }
        }
    }
}

fn serialize(mode: Mode, profile: &Profile, sink: &mut OutputSink, text: bool) -> Result<()> {
    let written = if text {
        profile.write_text(sink)
    } else {
        sink.write_all(&encode::to_pprof(profile))
    };
    written
        .and_then(|()| sink.flush())
        .map_err(|e| ProfilerError::flush(mode.as_str(), e.to_string()))
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

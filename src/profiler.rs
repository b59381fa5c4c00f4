//! Session lifecycle: the public [`Profiler`].
//!
//! A session starts when the profiler is constructed and stops exactly once,
//! either through [`Profiler::stop`] or when the signal given to
//! [`Profiler::run_until`] fires.

use std::future::Future;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use crate::config::{Config, Mode, ResolvedConfig};
use crate::dispatch::{Dispatcher, Running};
use crate::error::{ProfilerError, Result};
use crate::runtime::{Instrumentation, ProcessInstrumentation};
use crate::sink::OutputSink;

#[derive(Debug)]
enum SessionState {
    /// Configured off: no sink, no instrumentation.
    Disabled,
    Active(Running),
    Stopped,
}

/// One profiling session against the current process.
#[derive(Debug)]
pub struct Profiler {
    config: ResolvedConfig,
    dispatcher: Dispatcher,
    path: Option<PathBuf>,
    state: Mutex<SessionState>,
}

impl Profiler {
    /// Resolve the configuration and start profiling with the process
    /// instrumentation.
    ///
    /// # Errors
    ///
    /// Returns [`ProfilerError::InvalidMode`] for an unknown mode,
    /// [`ProfilerError::DirectoryCreation`] or [`ProfilerError::SinkOpen`] when
    /// the artifact cannot be created, and [`ProfilerError::AlreadyActive`] when
    /// a cpu or trace capture is already running.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use oya_pprof::{Config, Profiler};
    /// let profiler = Profiler::start(Config::new("heap").with_file_prefix("svc"))?;
    /// // ... work ...
    /// let artifact = profiler.stop()?;
    /// # Ok::<(), oya_pprof::ProfilerError>(())
    /// ```
    pub fn start(config: Config) -> Result<Self> {
        Self::start_with(config, Arc::new(ProcessInstrumentation))
    }

    /// Start profiling with the given instrumentation.
    ///
    /// A disabled configuration returns a no-op session without touching the
    /// filesystem or the instrumentation.
    ///
    /// # Errors
    ///
    /// Same as [`Profiler::start`].
    pub fn start_with(config: Config, instrumentation: Arc<dyn Instrumentation>) -> Result<Self> {
        let config = config.resolve()?;
        let dispatcher = Dispatcher::new(instrumentation);

        if config.is_disabled() {
            info!(mode = %config.mode(), "profiling disabled");
            return Ok(Self {
                config,
                dispatcher,
                path: None,
                state: Mutex::new(SessionState::Disabled),
            });
        }

        let sink = OutputSink::open(&config)?;
        let path = sink.path().to_path_buf();

        // the sink is dropped (closed) on failure; the empty file stays, since a
        // session started in the same second may be writing to the same name
        let running = dispatcher.start(&config, sink).inspect_err(|e| {
            warn!(mode = %config.mode(), error = %e, "profiling failed to start");
        })?;

        info!(mode = %config.mode(), path = %path.display(), "profiling started");

        Ok(Self {
            config,
            dispatcher,
            path: Some(path),
            state: Mutex::new(SessionState::Active(running)),
        })
    }

    /// Stop profiling, write the collected data and close the artifact.
    ///
    /// Returns the artifact path, or `None` for a disabled session. Stopping
    /// a disabled session is always a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ProfilerError::AlreadyStopped`] on any call after the first,
    /// and [`ProfilerError::Flush`] or [`ProfilerError::SinkClose`] when the
    /// collected data cannot be written. The artifact is closed in every case.
    pub fn stop(&self) -> Result<Option<PathBuf>> {
        let running = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match mem::replace(&mut *state, SessionState::Stopped) {
                SessionState::Disabled => {
                    *state = SessionState::Disabled;
                    return Ok(None);
                }
                SessionState::Stopped => {
                    return Err(ProfilerError::already_stopped(self.config.mode().as_str()));
                }
                SessionState::Active(running) => running,
            }
        };

        let mode = self.config.mode();
        match self.dispatcher.stop(mode, running) {
            Ok(path) => {
                info!(%mode, path = %path.display(), "profiling stopped");
                Ok(Some(path))
            }
            Err(err) => {
                warn!(%mode, error = %err, "profiling stopped with an error");
                Err(err)
            }
        }
    }

    /// Wait for `signal`, then stop.
    ///
    /// Cancellation only ends the wait; the stop sequence then runs to
    /// completion on the calling task.
    ///
    /// # Errors
    ///
    /// Same as [`Profiler::stop`].
    pub async fn run_until<F>(self, signal: F) -> Result<Option<PathBuf>>
    where
        F: Future<Output = ()>,
    {
        signal.await;
        self.stop()
    }

    /// Get the profiling mode
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.config.mode()
    }

    /// Get the resolved configuration
    #[must_use]
    pub const fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Get the artifact path (`None` when disabled)
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether instrumentation is running
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            SessionState::Active(_)
        )
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        if self.is_active() {
            if let Err(e) = self.stop() {
                warn!(mode = %self.config.mode(), error = %e, "profiling session dropped without a clean stop");
            }
        }
    }
}

/// Start a session, wait for `signal`, then stop it.
///
/// # Errors
///
/// Any error from [`Profiler::start`] or [`Profiler::stop`].
pub async fn run<F>(config: Config, signal: F) -> Result<Option<PathBuf>>
where
    F: Future<Output = ()>,
{
    Profiler::start(config)?.run_until(signal).await
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::indexing_slicing)]
    #![allow(clippy::arithmetic_side_effects)]

    use super::*;
    use crate::config::SamplerFormat;
    use crate::profile::{Profile, ValueType};
    use crate::runtime::{Capture, RateToggle, SnapshotKind, StreamKind};
    use std::io::Write;
    use tempfile::TempDir;

    /// Records every instrumentation call instead of touching the process.
    #[derive(Default)]
    struct RecordingInstrumentation {
        calls: Mutex<Vec<String>>,
        fail_snapshot: bool,
    }

    impl RecordingInstrumentation {
        fn failing_snapshots() -> Self {
            Self {
                fail_snapshot: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    struct FakeCapture {
        sink: OutputSink,
    }

    impl Capture for FakeCapture {
        fn finish(mut self: Box<Self>) -> Result<OutputSink> {
            self.sink
                .write_all(b"captured")
                .map_err(|e| ProfilerError::flush("fake", e.to_string()))?;
            Ok(self.sink)
        }
    }

    impl Instrumentation for RecordingInstrumentation {
        fn start_stream(&self, kind: StreamKind, sink: OutputSink) -> Result<Box<dyn Capture>> {
            self.push(format!("start_stream:{}", kind.as_str()));
            Ok(Box::new(FakeCapture { sink }))
        }

        fn enable_rate(&self, toggle: RateToggle, value: u64) {
            self.push(format!("enable_rate:{toggle:?}:{value}"));
        }

        fn disable_rate(&self, toggle: RateToggle) {
            self.push(format!("disable_rate:{toggle:?}"));
        }

        fn snapshot(&self, kind: SnapshotKind) -> Result<Profile> {
            self.push(format!("snapshot:{kind}"));
            if self.fail_snapshot {
                return Err(ProfilerError::flush(kind.as_str(), "snapshot unavailable"));
            }
            let mut profile = Profile::new(kind.as_str(), vec![ValueType::new("samples", "count")]);
            profile.add(vec!["leaf".into(), "root".into()], vec![3]);
            Ok(profile)
        }

        fn start_sampler(
            &self,
            format: SamplerFormat,
            sink: OutputSink,
        ) -> Result<Box<dyn Capture>> {
            self.push(format!("start_sampler:{format}"));
            Ok(Box::new(FakeCapture { sink }))
        }
    }

    fn start(config: Config) -> (Profiler, Arc<RecordingInstrumentation>) {
        let spy = Arc::new(RecordingInstrumentation::default());
        let profiler = Profiler::start_with(config, spy.clone()).unwrap();
        (profiler, spy)
    }

    #[test]
    fn test_disabled_session_never_touches_instrumentation_or_disk() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let (profiler, spy) = start(Config::new("mutex").with_output_dir(&out).disabled(true));

        assert!(!profiler.is_active());
        assert_eq!(profiler.path(), None);
        assert_eq!(profiler.stop().unwrap(), None);
        assert_eq!(profiler.stop().unwrap(), None);
        drop(profiler);

        assert!(spy.calls().is_empty());
        assert!(!out.exists());
    }

    #[test]
    fn test_invalid_mode_opens_no_sink() {
        let tmp = TempDir::new().unwrap();
        let spy = Arc::new(RecordingInstrumentation::default());
        let err = Profiler::start_with(
            Config::new("wallclock").with_output_dir(tmp.path()),
            spy.clone(),
        )
        .unwrap_err();

        assert!(matches!(err, ProfilerError::InvalidMode { .. }));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
        assert!(spy.calls().is_empty());
    }

    #[test]
    fn test_second_stop_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let (profiler, _spy) = start(Config::new("heap").with_output_dir(tmp.path()));

        assert!(profiler.stop().unwrap().is_some());
        let err = profiler.stop().unwrap_err();
        assert!(matches!(err, ProfilerError::AlreadyStopped { ref mode } if mode == "heap"));
        assert!(!profiler.is_active());
    }

    #[test]
    fn test_toggle_mode_enables_then_disables_before_snapshot() {
        let tmp = TempDir::new().unwrap();
        let (profiler, spy) = start(
            Config::new("mutex")
                .with_output_dir(tmp.path())
                .with_mutex_profile_fraction(5),
        );
        assert_eq!(spy.calls(), vec!["enable_rate:Mutex:5"]);

        let path = profiler.stop().unwrap().unwrap();
        assert_eq!(
            spy.calls(),
            vec!["enable_rate:Mutex:5", "disable_rate:Mutex", "snapshot:mutex"]
        );
        assert!(std::fs::metadata(path).unwrap().len() > 0);
    }

    #[test]
    fn test_block_mode_uses_block_rate() {
        let tmp = TempDir::new().unwrap();
        let (profiler, spy) = start(Config::new("block").with_output_dir(tmp.path()));
        profiler.stop().unwrap();
        assert_eq!(spy.calls()[0], "enable_rate:Block:10000");
    }

    #[test]
    fn test_snapshot_mode_has_no_start_action() {
        let tmp = TempDir::new().unwrap();
        let (profiler, spy) = start(Config::new("goroutine").with_output_dir(tmp.path()));
        assert!(spy.calls().is_empty());
        assert!(profiler.is_active());

        profiler.stop().unwrap();
        assert_eq!(spy.calls(), vec!["snapshot:goroutine"]);
    }

    #[test]
    fn test_text_format_renders_readable_snapshot() {
        let tmp = TempDir::new().unwrap();
        let (profiler, _spy) = start(
            Config::new("allocs")
                .with_output_dir(tmp.path())
                .with_text_format(true),
        );

        let path = profiler.stop().unwrap().unwrap();
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("txt"));
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.starts_with("--- allocs:"));
    }

    #[test]
    fn test_streaming_modes_hand_the_sink_to_the_capture() {
        let tmp = TempDir::new().unwrap();
        let (profiler, spy) = start(Config::new("trace").with_output_dir(tmp.path()));
        assert_eq!(spy.calls(), vec!["start_stream:trace"]);

        let path = profiler.stop().unwrap().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"captured");
    }

    #[test]
    fn test_sampler_mode_passes_format() {
        let tmp = TempDir::new().unwrap();
        let (profiler, spy) = start(
            Config::new("sampling_profiler")
                .with_output_dir(tmp.path())
                .with_sampling_profiler_format(SamplerFormat::Folded),
        );
        assert_eq!(spy.calls(), vec!["start_sampler:folded"]);
        profiler.stop().unwrap();
    }

    #[test]
    fn test_flush_error_is_returned_and_session_ends() {
        let tmp = TempDir::new().unwrap();
        let spy = Arc::new(RecordingInstrumentation::failing_snapshots());
        let profiler =
            Profiler::start_with(Config::new("heap").with_output_dir(tmp.path()), spy).unwrap();

        let err = profiler.stop().unwrap_err();
        assert!(matches!(err, ProfilerError::Flush { .. }));
        assert!(matches!(
            profiler.stop().unwrap_err(),
            ProfilerError::AlreadyStopped { .. }
        ));
    }

    #[test]
    fn test_drop_stops_an_active_session() {
        let tmp = TempDir::new().unwrap();
        let (profiler, spy) = start(Config::new("heap").with_output_dir(tmp.path()));
        drop(profiler);
        assert_eq!(spy.calls(), vec!["snapshot:heap"]);
    }

    #[tokio::test]
    async fn test_run_until_stops_when_signal_fires() {
        let tmp = TempDir::new().unwrap();
        let (profiler, spy) = start(Config::new("thread_create").with_output_dir(tmp.path()));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let session = tokio::spawn(profiler.run_until(async move {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();

        let path = session.await.unwrap().unwrap().unwrap();
        assert!(path.exists());
        assert_eq!(spy.calls(), vec!["snapshot:thread_create"]);
    }
}

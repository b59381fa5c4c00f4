//! Output sink: the single file a session writes its artifact into.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeZone};
use tracing::debug;

use crate::config::{Mode, ResolvedConfig};
use crate::error::{ProfilerError, Result};

/// Timestamp layout used in artifact names (second resolution, local time).
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H:%M:%S";

/// Build the artifact file name: `{prefix_}{mode}_{timestamp}.{ext}`.
///
/// Pure and deterministic: two calls with the same inputs within the same
/// second return the same name.
#[must_use]
pub fn file_name<Tz>(mode: Mode, prefix: Option<&str>, at: &DateTime<Tz>, ext: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let stamp = at.format(TIMESTAMP_FORMAT);
    match prefix.filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}_{mode}_{stamp}.{ext}"),
        None => format!("{mode}_{stamp}.{ext}"),
    }
}

/// Writable, explicitly closable profile destination.
///
/// Dropping an unclosed sink still closes the file, but swallows any flush
/// error; call [`OutputSink::close`] to observe it.
#[derive(Debug)]
pub struct OutputSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl OutputSink {
    /// Create the artifact for a resolved configuration, stamped with the
    /// current local time.
    ///
    /// # Errors
    ///
    /// Returns [`ProfilerError::DirectoryCreation`] when the output directory
    /// cannot be created and [`ProfilerError::SinkOpen`] when the file cannot
    /// be created.
    pub fn open(config: &ResolvedConfig) -> Result<Self> {
        let name = file_name(
            config.mode(),
            config.file_prefix(),
            &Local::now(),
            config.extension(),
        );
        Self::create(config.output_dir(), &name)
    }

    /// Create `dir/name`, creating `dir` recursively and truncating any
    /// existing file.
    ///
    /// # Errors
    ///
    /// Same as [`OutputSink::open`].
    pub fn create(dir: &Path, name: &str) -> Result<Self> {
        create_dir_all(dir)
            .map_err(|e| ProfilerError::directory_creation(dir, e.to_string()))?;

        let path = dir.join(name);
        let file =
            File::create(&path).map_err(|e| ProfilerError::sink_open(&path, e.to_string()))?;

        debug!(path = %path.display(), "opened profile output");

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Get the artifact path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush buffered bytes, sync the file to disk and close it.
    ///
    /// # Errors
    ///
    /// Returns [`ProfilerError::SinkClose`] if flushing or syncing fails.
    pub fn close(self) -> Result<PathBuf> {
        let Self { path, writer } = self;

        let file = writer
            .into_inner()
            .map_err(|e| ProfilerError::sink_close(&path, e.error().to_string()))?;
        file.sync_all()
            .map_err(|e| ProfilerError::sink_close(&path, e.to_string()))?;

        debug!(path = %path.display(), "closed profile output");
        Ok(path)
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.writer.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(unix)]
fn create_dir_all(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)
}

#[cfg(not(unix))]
fn create_dir_all(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

//! Error types for profiling sessions.
//!
//! Every failure is typed and returned; nothing in the library aborts the process.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for profiling operations.
pub type Result<T> = std::result::Result<T, ProfilerError>;

/// Errors raised while resolving, starting or stopping a profiling session.
#[derive(Debug, Error)]
pub enum ProfilerError {
    // Configuration errors
    #[error("invalid profile mode '{mode}'")]
    InvalidMode { mode: String },

    #[error("invalid profiler configuration: {reason}")]
    InvalidConfig { reason: String },

    // Output sink errors
    #[error("failed to create output directory '{path}': {reason}")]
    DirectoryCreation { path: PathBuf, reason: String },

    #[error("failed to open profile output '{path}': {reason}")]
    SinkOpen { path: PathBuf, reason: String },

    #[error("failed to close profile output '{path}': {reason}")]
    SinkClose { path: PathBuf, reason: String },

    // Session lifecycle errors
    #[error("{mode} profiling is already active in this process")]
    AlreadyActive { mode: String },

    #[error("{mode} profiling session was already stopped")]
    AlreadyStopped { mode: String },

    #[error("failed to flush {mode} profile: {reason}")]
    Flush { mode: String, reason: String },

    // Instrumentation errors
    #[error("failed to start {mode} instrumentation: {reason}")]
    Instrumentation { mode: String, reason: String },

    #[error("{mode} profiling is not supported here: {reason}")]
    Unsupported { mode: String, reason: String },
}

impl ProfilerError {
    /// Create an invalid mode error.
    pub fn invalid_mode(mode: impl Into<String>) -> Self {
        Self::InvalidMode { mode: mode.into() }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a directory creation error.
    pub fn directory_creation(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DirectoryCreation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a sink open error.
    pub fn sink_open(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::SinkOpen {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a sink close error.
    pub fn sink_close(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::SinkClose {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an already-active error.
    pub fn already_active(mode: impl Into<String>) -> Self {
        Self::AlreadyActive { mode: mode.into() }
    }

    /// Create an already-stopped error.
    pub fn already_stopped(mode: impl Into<String>) -> Self {
        Self::AlreadyStopped { mode: mode.into() }
    }

    /// Create a flush error.
    pub fn flush(mode: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Flush {
            mode: mode.into(),
            reason: reason.into(),
        }
    }

    /// Create an instrumentation start error.
    pub fn instrumentation(mode: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Instrumentation {
            mode: mode.into(),
            reason: reason.into(),
        }
    }

    /// Create an unsupported-platform error.
    pub fn unsupported(mode: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            mode: mode.into(),
            reason: reason.into(),
        }
    }
}

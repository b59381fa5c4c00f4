//! Shared helpers for integration tests.
//!
//! Instrumentation is process-wide, so tests in one binary that start real
//! sessions take [`serial`] first.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::arithmetic_side_effects)]

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tempfile::TempDir;

static SERIAL: Mutex<()> = Mutex::new(());

/// Hold the process-wide session lock for the rest of the test.
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fresh output directory, removed when dropped.
pub fn output_dir() -> TempDir {
    TempDir::new().expect("create temp dir")
}

/// Every file in `dir`, sorted.
pub fn artifacts(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .expect("read output dir")
        .map(|entry| entry.expect("dir entry").path())
        .collect();
    files.sort();
    files
}

/// File name of `path` as a string.
pub fn name_of(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .expect("utf-8 file name")
}

/// Decode a binary pprof artifact.
pub fn decode(path: &Path) -> oya_pprof::encode::proto::Profile {
    use prost::Message;

    let bytes = std::fs::read(path).expect("read artifact");
    assert!(!bytes.is_empty(), "artifact {} is empty", path.display());
    oya_pprof::encode::proto::Profile::decode(bytes.as_slice()).expect("valid pprof")
}

/// Entry of a decoded profile's string table.
pub fn string_at(profile: &oya_pprof::encode::proto::Profile, index: i64) -> &str {
    usize::try_from(index)
        .ok()
        .and_then(|i| profile.string_table.get(i))
        .map_or("", String::as_str)
}

/// Burn CPU for roughly `ms` milliseconds.
pub fn spin(ms: u64) -> u64 {
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(ms);
    let mut acc = 0_u64;
    while std::time::Instant::now() < deadline {
        acc = (0..1_000_u64).fold(acc, |a, x| a.wrapping_mul(31).wrapping_add(x));
    }
    acc
}

//! Thread creation and live thread profiles.

use std::collections::HashMap;
use std::io;
use std::sync::{LazyLock, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::{ProfilerError, Result};
use crate::profile::{Profile, ValueType};
use crate::stack::{self, RawStack};

static CREATION_SITES: LazyLock<Mutex<HashMap<RawStack, i64>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn record_creation() {
    let raw = RawStack::capture();
    let mut sites = CREATION_SITES
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let count = sites.entry(raw).or_default();
    *count = count.saturating_add(1);
}

/// Spawn a named thread, recording where it was created.
///
/// Creation stacks are always recorded, whether or not a session is running.
///
/// # Errors
///
/// Returns the OS error if the thread cannot be created.
pub fn spawn<F, T>(name: impl Into<String>, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let handle = thread::Builder::new().name(name.into()).spawn(f)?;
    record_creation();
    Ok(handle)
}

/// Threads created through [`spawn`], grouped by creation stack.
#[must_use]
pub fn thread_create_profile() -> Profile {
    let recorded: Vec<(RawStack, Vec<i64>)> = CREATION_SITES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(raw, count)| (raw.clone(), vec![*count]))
        .collect();
    let stacks = stack::resolve_all(recorded);

    Profile::from_stacks("thread_create", vec![ValueType::new("threads", "count")], stacks)
}

/// One live OS thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadInfo {
    pub tid: u64,
    pub name: String,
    pub state: ThreadState,
}

/// Scheduler state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    Running,
    Sleeping,
    DiskWait,
    Stopped,
    Zombie,
    Unknown,
}

impl ThreadState {
    /// Map a `/proc/<pid>/stat` state letter
    #[must_use]
    pub const fn from_proc(code: char) -> Self {
        match code {
            'R' => Self::Running,
            'S' | 'I' => Self::Sleeping,
            'D' => Self::DiskWait,
            'T' | 't' => Self::Stopped,
            'Z' | 'X' => Self::Zombie,
            _ => Self::Unknown,
        }
    }

    /// Frame label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::DiskWait => "disk_wait",
            Self::Stopped => "stopped",
            Self::Zombie => "zombie",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the thread was on CPU
    #[must_use]
    pub const fn is_on_cpu(self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Parse one `/proc/<pid>/task/<tid>/stat` line.
///
/// The command name is wrapped in parentheses and may itself contain spaces
/// and parentheses, so the state is read after the last `)`.
#[must_use]
pub fn parse_task_stat(line: &str) -> Option<ThreadInfo> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    let tid = line.get(..open)?.trim().parse().ok()?;
    let name = line.get(open.checked_add(1)?..close)?.to_owned();
    let state = line
        .get(close.checked_add(1)?..)?
        .split_whitespace()
        .next()?
        .chars()
        .next()
        .map_or(ThreadState::Unknown, ThreadState::from_proc);

    Some(ThreadInfo { tid, name, state })
}

/// Every thread of the current process.
///
/// # Errors
///
/// Returns an error if the task directory cannot be listed.
#[cfg(target_os = "linux")]
pub fn live_threads() -> io::Result<Vec<ThreadInfo>> {
    let mut threads = Vec::new();
    for entry in std::fs::read_dir("/proc/self/task")? {
        let stat_path = entry?.path().join("stat");
        // threads may exit between listing and reading
        if let Some(info) = std::fs::read_to_string(stat_path)
            .ok()
            .as_deref()
            .and_then(parse_task_stat)
        {
            threads.push(info);
        }
    }
    Ok(threads)
}

/// Every thread of the current process.
///
/// Without procfs only the calling thread is visible.
///
/// # Errors
///
/// Never fails on this platform.
#[cfg(not(target_os = "linux"))]
pub fn live_threads() -> io::Result<Vec<ThreadInfo>> {
    let current = thread::current();
    Ok(vec![ThreadInfo {
        tid: 0,
        name: current.name().unwrap_or("unnamed").to_owned(),
        state: ThreadState::Running,
    }])
}

/// Live threads grouped by name and state.
///
/// # Errors
///
/// Returns [`ProfilerError::Flush`] if the thread list cannot be read.
pub fn live_threads_profile() -> Result<Profile> {
    let threads = live_threads()
        .map_err(|e| ProfilerError::flush("goroutine", format!("listing threads: {e}")))?;

    let mut stacks: HashMap<Vec<String>, Vec<i64>> = HashMap::new();
    for info in threads {
        let entry = stacks
            .entry(vec![info.state.as_str().to_owned(), info.name])
            .or_insert_with(|| vec![0]);
        if let Some(count) = entry.first_mut() {
            *count = count.saturating_add(1);
        }
    }

    Ok(Profile::from_stacks(
        "goroutine",
        vec![ValueType::new("threads", "count")],
        stacks,
    ))
}

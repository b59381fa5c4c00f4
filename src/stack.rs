//! Stack capture for the event-driven profiles (mutex, block, thread
//! creation, allocation sites).
//!
//! Recording only walks the stack and keeps instruction pointers. Symbol
//! lookup is deferred to [`RawStack::resolve`], which snapshots call when a
//! session stops, so the hot paths never touch debug info.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;

/// Frames kept per resolved stack.
pub const MAX_DEPTH: usize = 64;

/// Frames walked per capture; leaves room for the internal frames that
/// resolution drops.
const CAPTURE_DEPTH: usize = 96;

/// Frames belonging to the capture machinery, the allocator, or the runtime
/// hooks themselves.
const SKIPPED_PREFIXES: &[&str] = &[
    "backtrace::",
    "oya_pprof::stack::",
    "<oya_pprof::stack::",
    "oya_pprof::runtime::",
    "<oya_pprof::runtime::",
    "__rust_",
    "__rustc::",
    "__rdl_",
    "__rg_",
    "alloc::alloc::",
];

/// An unresolved call stack: instruction pointers, leaf first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RawStack {
    ips: Vec<usize>,
}

impl RawStack {
    /// Walk the calling stack without symbolizing it.
    #[must_use]
    pub fn capture() -> Self {
        let mut ips = Vec::with_capacity(CAPTURE_DEPTH);
        backtrace::trace(|frame| {
            ips.push(frame.ip().addr());
            ips.len() < CAPTURE_DEPTH
        });
        Self { ips }
    }

    /// Instruction pointers, leaf first
    #[must_use]
    pub fn ips(&self) -> &[usize] {
        &self.ips
    }

    /// Symbolize the stack, leaf first, with demangled names.
    ///
    /// Leading internal frames are dropped and the result is capped at
    /// [`MAX_DEPTH`]. Inlined calls expand to one name each; addresses without
    /// symbols render as hex.
    #[must_use]
    pub fn resolve(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.ips.len());
        for &ip in &self.ips {
            let before = names.len();
            backtrace::resolve(ptr::without_provenance_mut::<c_void>(ip), |symbol| {
                names.push(
                    symbol
                        .name()
                        .map_or_else(|| format!("{ip:#x}"), |name| format!("{name:#}")),
                );
            });
            if names.len() == before {
                names.push(format!("{ip:#x}"));
            }
        }

        let frames: Vec<String> = names
            .into_iter()
            .skip_while(|name| is_internal(name))
            .take(MAX_DEPTH)
            .collect();

        if frames.is_empty() {
            vec![String::from("[unknown]")]
        } else {
            frames
        }
    }
}

fn is_internal(name: &str) -> bool {
    SKIPPED_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// Resolve recorded stacks and sum the values of stacks that symbolize to
/// the same frames.
pub fn resolve_all<I>(recorded: I) -> HashMap<Vec<String>, Vec<i64>>
where
    I: IntoIterator<Item = (RawStack, Vec<i64>)>,
{
    let mut stacks: HashMap<Vec<String>, Vec<i64>> = HashMap::new();
    for (raw, values) in recorded {
        let entry = stacks
            .entry(raw.resolve())
            .or_insert_with(|| vec![0; values.len()]);
        for (acc, value) in entry.iter_mut().zip(values) {
            *acc = acc.saturating_add(value);
        }
    }
    stacks
}

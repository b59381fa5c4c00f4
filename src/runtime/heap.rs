//! Heap and allocation profiles backed by a counting global allocator.
//!
//! Install [`TrackingAllocator`] as the global allocator to populate the
//! `heap` and `allocs` profiles:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: oya_pprof::TrackingAllocator = oya_pprof::TrackingAllocator::system();
//! ```
//!
//! Every allocation and free is counted. On top of the counters, each thread
//! records the call stack of roughly one allocation per [`SAMPLE_RATE`]
//! bytes, keyed by unresolved stack, and follows the sampled block until it
//! is freed. Snapshots symbolize the recorded sites and scale them up to
//! estimated totals.
//!
//! Without the allocator both profiles are well-formed but report zeroes.

#![allow(unsafe_code)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{LazyLock, Mutex, PoisonError};

use crate::profile::{Profile, ValueType};
use crate::stack::{self, RawStack};

/// Average number of bytes allocated between two recorded allocation sites.
pub const SAMPLE_RATE: u64 = 524_288;

static ALLOC_OBJECTS: AtomicU64 = AtomicU64::new(0);
static ALLOC_BYTES: AtomicU64 = AtomicU64::new(0);
static FREE_OBJECTS: AtomicU64 = AtomicU64::new(0);
static FREE_BYTES: AtomicU64 = AtomicU64::new(0);

fn count_alloc(size: usize) {
    ALLOC_OBJECTS.fetch_add(1, Ordering::Relaxed);
    ALLOC_BYTES.fetch_add(size as u64, Ordering::Relaxed);
}

fn count_free(size: usize) {
    FREE_OBJECTS.fetch_add(1, Ordering::Relaxed);
    FREE_BYTES.fetch_add(size as u64, Ordering::Relaxed);
}

thread_local! {
    static BUSY: Cell<bool> = const { Cell::new(false) };
    static UNTIL_SAMPLE: Cell<u64> = const { Cell::new(SAMPLE_RATE) };
}

/// Marks the current thread as inside the site recorder. Allocations made
/// while it is held are counted but never sampled.
struct Busy;

impl Busy {
    fn enter() -> Option<Self> {
        BUSY.try_with(|busy| if busy.replace(true) { None } else { Some(Self) })
            .ok()
            .flatten()
    }

    fn is_held() -> bool {
        BUSY.try_with(Cell::get).unwrap_or(true)
    }
}

impl Drop for Busy {
    fn drop(&mut self) {
        let _ = BUSY.try_with(|busy| busy.set(false));
    }
}

/// Advance a byte countdown by one allocation.
///
/// Returns the next countdown and whether this allocation is sampled.
const fn advance(remaining: u64, size: u64, rate: u64) -> (u64, bool) {
    if size >= remaining {
        (rate, true)
    } else {
        (remaining.saturating_sub(size), false)
    }
}

/// Objects and bytes that one sampled allocation of `size` bytes stands for.
const fn scaled(size: u64, rate: u64) -> (u64, u64) {
    if size >= rate {
        return (1, size);
    }
    match rate.checked_div(size) {
        Some(objects) => (objects, objects.saturating_mul(size)),
        None => (1, size),
    }
}

/// Sampled block addresses still live. Lock-free so every free can check
/// membership without touching the site table.
const TRACKED_SLOTS: usize = 4096;
const SLOT_MASK: usize = 4095;
const SLOT_ATTEMPTS: usize = 8;

static TRACKED: [AtomicUsize; TRACKED_SLOTS] = [const { AtomicUsize::new(0) }; TRACKED_SLOTS];
static TRACKED_LIVE: AtomicUsize = AtomicUsize::new(0);

fn slots(addr: usize) -> impl Iterator<Item = &'static AtomicUsize> {
    let home = addr.wrapping_shr(4);
    (0..SLOT_ATTEMPTS).filter_map(move |step| TRACKED.get(home.wrapping_add(step) & SLOT_MASK))
}

fn track(addr: usize) -> bool {
    let tracked = slots(addr).any(|slot| {
        slot.compare_exchange(0, addr, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    });
    if tracked {
        TRACKED_LIVE.fetch_add(1, Ordering::Relaxed);
    }
    tracked
}

fn untrack(addr: usize) -> bool {
    if TRACKED_LIVE.load(Ordering::Relaxed) == 0 {
        return false;
    }
    let found = slots(addr).any(|slot| {
        slot.compare_exchange(addr, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    });
    if found {
        TRACKED_LIVE.fetch_sub(1, Ordering::Relaxed);
    }
    found
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SiteStats {
    alloc_objects: u64,
    alloc_bytes: u64,
    free_objects: u64,
    free_bytes: u64,
}

impl SiteStats {
    fn values(&self) -> Vec<i64> {
        vec![
            to_i64(self.alloc_objects),
            to_i64(self.alloc_bytes),
            to_i64(self.alloc_objects.saturating_sub(self.free_objects)),
            to_i64(self.alloc_bytes.saturating_sub(self.free_bytes)),
        ]
    }
}

#[derive(Debug)]
struct LiveBlock {
    site: RawStack,
    objects: u64,
    bytes: u64,
}

#[derive(Debug, Default)]
struct Sites {
    by_stack: HashMap<RawStack, SiteStats>,
    live: HashMap<usize, LiveBlock>,
}

static SITES: LazyLock<Mutex<Sites>> = LazyLock::new(|| Mutex::new(Sites::default()));

fn sample_alloc(ptr: *mut u8, size: usize) {
    if Busy::is_held() {
        return;
    }
    let size = size as u64;
    let due = UNTIL_SAMPLE
        .try_with(|left| {
            let (next, due) = advance(left.get(), size, SAMPLE_RATE);
            left.set(next);
            due
        })
        .unwrap_or(false);
    if due {
        record_site(ptr.addr(), size);
    }
}

fn record_site(addr: usize, size: u64) {
    let Some(_busy) = Busy::enter() else {
        return;
    };
    let site = RawStack::capture();
    let (objects, bytes) = scaled(size, SAMPLE_RATE);

    let mut sites = SITES.lock().unwrap_or_else(PoisonError::into_inner);
    let stats = sites.by_stack.entry(site.clone()).or_default();
    stats.alloc_objects = stats.alloc_objects.saturating_add(objects);
    stats.alloc_bytes = stats.alloc_bytes.saturating_add(bytes);
    if track(addr) {
        sites.live.insert(addr, LiveBlock { site, objects, bytes });
    }
}

fn sample_free(ptr: *mut u8) {
    let addr = ptr.addr();
    if !untrack(addr) {
        return;
    }
    let Some(_busy) = Busy::enter() else {
        return;
    };
    let mut sites = SITES.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(block) = sites.live.remove(&addr) {
        let stats = sites.by_stack.entry(block.site).or_default();
        stats.free_objects = stats.free_objects.saturating_add(block.objects);
        stats.free_bytes = stats.free_bytes.saturating_add(block.bytes);
    }
}

/// Global allocator wrapper that counts allocations and frees and records
/// sampled allocation sites.
///
/// Counting is lock-free and allocation-free. Site recording runs on roughly
/// one allocation per [`SAMPLE_RATE`] bytes, under a per-thread guard so the
/// recorder's own allocations are never sampled.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrackingAllocator<A = System> {
    inner: A,
}

impl TrackingAllocator<System> {
    /// Wrap the system allocator
    #[must_use]
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A> TrackingAllocator<A> {
    /// Wrap another allocator
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

// SAFETY: every call is forwarded unchanged to the wrapped allocator. The
// bookkeeping only observes layouts and addresses and never touches the
// returned memory. A sampled address is untracked before it is handed back
// to the inner allocator, so a reused address cannot be mistaken for it.
unsafe impl<A: GlobalAlloc> GlobalAlloc for TrackingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: caller upholds `GlobalAlloc::alloc` requirements.
        let ptr = unsafe { self.inner.alloc(layout) };
        if !ptr.is_null() {
            count_alloc(layout.size());
            sample_alloc(ptr, layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: caller upholds `GlobalAlloc::alloc_zeroed` requirements.
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        if !ptr.is_null() {
            count_alloc(layout.size());
            sample_alloc(ptr, layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        sample_free(ptr);
        // SAFETY: caller upholds `GlobalAlloc::dealloc` requirements.
        unsafe { self.inner.dealloc(ptr, layout) };
        count_free(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        sample_free(ptr);
        // SAFETY: caller upholds `GlobalAlloc::realloc` requirements.
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            count_free(layout.size());
            count_alloc(new_size);
            sample_alloc(new_ptr, new_size);
        }
        new_ptr
    }
}

/// Allocation counters at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub alloc_objects: u64,
    pub alloc_bytes: u64,
    pub free_objects: u64,
    pub free_bytes: u64,
}

impl HeapStats {
    /// Read the current counters
    #[must_use]
    pub fn current() -> Self {
        Self {
            alloc_objects: ALLOC_OBJECTS.load(Ordering::Relaxed),
            alloc_bytes: ALLOC_BYTES.load(Ordering::Relaxed),
            free_objects: FREE_OBJECTS.load(Ordering::Relaxed),
            free_bytes: FREE_BYTES.load(Ordering::Relaxed),
        }
    }

    /// Objects allocated and not yet freed
    #[must_use]
    pub const fn inuse_objects(&self) -> u64 {
        self.alloc_objects.saturating_sub(self.free_objects)
    }

    /// Bytes allocated and not yet freed
    #[must_use]
    pub const fn inuse_bytes(&self) -> u64 {
        self.alloc_bytes.saturating_sub(self.free_bytes)
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Recorded allocation sites, symbolized and merged.
fn site_stacks() -> HashMap<Vec<String>, Vec<i64>> {
    let _busy = Busy::enter();
    let recorded: Vec<(RawStack, Vec<i64>)> = SITES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .by_stack
        .iter()
        .map(|(site, stats)| (site.clone(), stats.values()))
        .collect();
    stack::resolve_all(recorded)
}

fn memory_profile(name: &str, default_sample_type: &str) -> Profile {
    let mut stacks = site_stacks();
    if stacks.is_empty() {
        let stats = HeapStats::current();
        stacks.insert(
            vec![String::from("[process]")],
            vec![
                to_i64(stats.alloc_objects),
                to_i64(stats.alloc_bytes),
                to_i64(stats.inuse_objects()),
                to_i64(stats.inuse_bytes()),
            ],
        );
    }

    Profile::from_stacks(
        name,
        vec![
            ValueType::new("alloc_objects", "count"),
            ValueType::new("alloc_space", "bytes"),
            ValueType::new("inuse_objects", "count"),
            ValueType::new("inuse_space", "bytes"),
        ],
        stacks,
    )
    .with_period(ValueType::new("space", "bytes"), to_i64(SAMPLE_RATE))
    .with_default_sample_type(default_sample_type)
}

/// Live heap snapshot, read as in-use space by default.
///
/// Samples are the recorded allocation sites. Before any site has been
/// recorded, a single `[process]` sample carries the counter totals.
#[must_use]
pub fn heap_profile() -> Profile {
    memory_profile("heap", "inuse_space")
}

/// Cumulative allocation snapshot, read as allocated space by default.
///
/// Same samples as [`heap_profile`].
#[must_use]
pub fn allocs_profile() -> Profile {
    memory_profile("allocs", "alloc_space")
}

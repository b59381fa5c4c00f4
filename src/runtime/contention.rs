//! Lock contention and blocking profiles.
//!
//! Two process-wide knobs drive sampling: the mutex profile fraction (record
//! one in N contended acquisitions of a [`ProfiledMutex`]) and the block
//! profile rate (record one event per N nanoseconds spent blocked). Both are
//! zero, meaning off, until a session raises them. They are reference counted
//! so that only the last session to stop resets them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use super::RateToggle;
use crate::profile::{Profile, ValueType};
use crate::stack::{self, RawStack};

/// Reference-counted process-wide rate.
#[derive(Debug)]
pub struct SharedToggle {
    name: &'static str,
    owners: Mutex<usize>,
    value: AtomicU64,
}

impl SharedToggle {
    const fn new(name: &'static str) -> Self {
        Self {
            name,
            owners: Mutex::new(0),
            value: AtomicU64::new(0),
        }
    }

    /// Register an owner. The first owner sets the value; later owners keep it.
    pub fn acquire(&self, value: u64) {
        let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        if *owners == 0 {
            self.value.store(value, Ordering::SeqCst);
            debug!(toggle = self.name, value, "enabled sampling");
        } else {
            debug!(
                toggle = self.name,
                owners = *owners,
                current = self.value.load(Ordering::SeqCst),
                requested = value,
                "sampling already enabled, keeping current value"
            );
        }
        *owners = owners.saturating_add(1);
    }

    /// Release an owner. The last owner resets the value to zero.
    pub fn release(&self) {
        let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        *owners = owners.saturating_sub(1);
        if *owners == 0 {
            self.value.store(0, Ordering::SeqCst);
            debug!(toggle = self.name, "disabled sampling");
        }
    }

    /// Current value, zero when off.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Number of sessions holding the toggle
    #[must_use]
    pub fn owners(&self) -> usize {
        *self.owners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

static MUTEX_FRACTION: SharedToggle = SharedToggle::new("mutex_profile_fraction");
static BLOCK_RATE: SharedToggle = SharedToggle::new("block_profile_rate");

/// The shared knob behind a toggle.
#[must_use]
pub fn toggle(toggle: RateToggle) -> &'static SharedToggle {
    match toggle {
        RateToggle::Mutex => &MUTEX_FRACTION,
        RateToggle::Block => &BLOCK_RATE,
    }
}

/// Current mutex profile fraction (0 when off).
#[must_use]
pub fn mutex_profile_fraction() -> u64 {
    MUTEX_FRACTION.current()
}

/// Current block profile rate in nanoseconds (0 when off).
#[must_use]
pub fn block_profile_rate() -> u64 {
    BLOCK_RATE.current()
}

#[derive(Debug, Clone, Copy, Default)]
struct EventStats {
    count: i64,
    delay_ns: i64,
}

type EventTable = Mutex<HashMap<RawStack, EventStats>>;

static MUTEX_EVENTS: LazyLock<EventTable> = LazyLock::new(|| Mutex::new(HashMap::new()));
static BLOCK_EVENTS: LazyLock<EventTable> = LazyLock::new(|| Mutex::new(HashMap::new()));
static CONTENDED: AtomicU64 = AtomicU64::new(0);

fn record(table: &EventTable, count: i64, delay_ns: i64) {
    let raw = RawStack::capture();
    let mut events = table.lock().unwrap_or_else(PoisonError::into_inner);
    let stats = events.entry(raw).or_default();
    stats.count = stats.count.saturating_add(count);
    stats.delay_ns = stats.delay_ns.saturating_add(delay_ns);
}

fn nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

/// Whether the `tick`-th event is kept when sampling one in `fraction`.
#[must_use]
pub const fn sample_one_in(tick: u64, fraction: u64) -> bool {
    matches!(tick.checked_rem(fraction), Some(0))
}

/// Record a contended acquisition that waited `wait`.
///
/// Kept samples are scaled by the fraction so the profile estimates totals.
pub fn record_contention(wait: Duration) {
    let fraction = mutex_profile_fraction();
    if fraction > 0 {
        let tick = CONTENDED.fetch_add(1, Ordering::Relaxed);
        if sample_one_in(tick, fraction) {
            let scale = i64::try_from(fraction).unwrap_or(i64::MAX);
            record(&MUTEX_EVENTS, scale, nanos(wait).saturating_mul(scale));
        }
    }
    record_blocking(wait);
}

/// Record time spent blocked.
///
/// Events at least as long as the block rate are always kept; shorter ones
/// are kept with probability `wait / rate` and scaled up to one rate unit.
pub fn record_blocking(wait: Duration) {
    let rate = block_profile_rate();
    if rate == 0 {
        return;
    }
    let wait_ns = u64::try_from(wait.as_nanos()).unwrap_or(u64::MAX);
    if wait_ns >= rate {
        record(&BLOCK_EVENTS, 1, nanos(wait));
    } else if wait_ns > 0 && rand::thread_rng().gen_range(0..rate) < wait_ns {
        let count = rate
            .checked_div(wait_ns)
            .and_then(|n| i64::try_from(n).ok())
            .unwrap_or(i64::MAX);
        record(&BLOCK_EVENTS, count, i64::try_from(rate).unwrap_or(i64::MAX));
    }
}

/// Run a blocking operation and record the time it took in the block profile.
pub fn track_blocking<F, R>(operation: F) -> R
where
    F: FnOnce() -> R,
{
    let started = Instant::now();
    let result = operation();
    record_blocking(started.elapsed());
    result
}

fn snapshot(name: &str, table: &EventTable) -> Profile {
    let recorded: Vec<(RawStack, Vec<i64>)> = table
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(raw, stats)| (raw.clone(), vec![stats.count, stats.delay_ns]))
        .collect();
    let stacks = stack::resolve_all(recorded);

    Profile::from_stacks(
        name,
        vec![
            ValueType::new("contentions", "count"),
            ValueType::new("delay", "nanoseconds"),
        ],
        stacks,
    )
}

/// Contended acquisitions recorded since process start.
#[must_use]
pub fn mutex_profile() -> Profile {
    snapshot("mutex", &MUTEX_EVENTS)
}

/// Blocking events recorded since process start.
#[must_use]
pub fn block_profile() -> Profile {
    snapshot("block", &BLOCK_EVENTS)
}

/// A mutex whose contended acquisitions feed the mutex and block profiles.
///
/// Poisoning is ignored: a panic while holding the lock does not make later
/// acquisitions fail.
#[derive(Debug, Default)]
pub struct ProfiledMutex<T> {
    inner: Mutex<T>,
}

impl<T> ProfiledMutex<T> {
    /// Create a profiled mutex
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the lock, recording the wait if another thread held it.
    ///
    /// The wait is recorded after the lock is taken. Recording only walks the
    /// stack; symbols are looked up when a mutex or block profile is taken.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        match self.inner.try_lock() {
            Ok(guard) => return guard,
            Err(TryLockError::Poisoned(poisoned)) => return poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {}
        }

        let started = Instant::now();
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        record_contention(started.elapsed());
        guard
    }

    /// Consume the mutex, returning the value
    pub fn into_inner(self) -> T {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutable access without locking
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::indexing_slicing)]
    #![allow(clippy::arithmetic_side_effects)]

    use super::*;

    #[test]
    fn test_sample_one_in() {
        assert!(!sample_one_in(0, 0));
        assert!(sample_one_in(0, 5));
        assert!(!sample_one_in(3, 5));
        assert!(sample_one_in(10, 5));
        assert_eq!((0..100).filter(|t| sample_one_in(*t, 10)).count(), 10);
        assert!(!sample_one_in(u64::MAX, 0));
        assert!(sample_one_in(u64::MAX, 1));
    }

    fn record_from_one_site(table: &EventTable) {
        for _ in 0..2 {
            record(table, 1, 5);
        }
    }

    #[test]
    fn test_events_keep_raw_stacks_until_snapshot() {
        let table: EventTable = Mutex::new(HashMap::new());
        record_from_one_site(&table);

        {
            let events = table.lock().unwrap();
            assert_eq!(events.len(), 1);
            let (raw, stats) = events.iter().next().unwrap();
            assert!(!raw.ips().is_empty());
            assert_eq!(stats.count, 2);
            assert_eq!(stats.delay_ns, 10);
        }

        let profile = snapshot("mutex", &table);
        assert_eq!(profile.samples().len(), 1);
        let sample = &profile.samples()[0];
        assert_eq!(sample.values, vec![2, 10]);
        assert!(!sample.frames[0].starts_with("oya_pprof::runtime::"));
        assert!(!sample.frames[0].starts_with("backtrace::"));
    }

    #[test]
    fn test_toggle_is_reference_counted() {
        let knob = SharedToggle::new("test");
        knob.acquire(5);
        knob.acquire(7);
        assert_eq!(knob.current(), 5);
        assert_eq!(knob.owners(), 2);

        knob.release();
        assert_eq!(knob.current(), 5);

        knob.release();
        assert_eq!(knob.current(), 0);
        assert_eq!(knob.owners(), 0);
    }

    #[test]
    fn test_release_without_owner_stays_off() {
        let knob = SharedToggle::new("test");
        knob.release();
        assert_eq!(knob.current(), 0);
        assert_eq!(knob.owners(), 0);
    }

    #[test]
    fn test_uncontended_lock_round_trips_value() {
        let mutex = ProfiledMutex::new(1_u32);
        *mutex.lock() += 1;
        assert_eq!(mutex.into_inner(), 2);
    }

    #[test]
    fn test_profiles_have_contention_value_types() {
        let profile = mutex_profile();
        assert_eq!(profile.name(), "mutex");
        assert_eq!(profile.sample_types().len(), 2);
        assert_eq!(block_profile().name(), "block");
    }
}

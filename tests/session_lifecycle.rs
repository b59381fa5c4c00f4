//! Session lifecycle tests against the real process instrumentation.
//!
//! Covers:
//! - Artifact naming and placement
//! - Rate toggles raised for the session and reset at stop
//! - Binary and text snapshot output
//! - Exclusive streaming captures
//! - Signal-driven stop through `run_until` / `run`

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![allow(clippy::arithmetic_side_effects)]

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use oya_pprof::{
    Config, ProfiledMutex, Profiler, ProfilerError, SamplerFormat, block_profile_rate,
    mutex_profile_fraction, track_blocking,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Force at least one contended acquisition on `lock`.
fn contend(lock: &Arc<ProfiledMutex<u64>>) -> TestResult {
    let guard = lock.lock();
    let waiter = {
        let lock = Arc::clone(lock);
        thread::spawn(move || {
            *lock.lock() += 1;
        })
    };
    thread::sleep(Duration::from_millis(20));
    drop(guard);
    waiter.join().map_err(|_| "waiter panicked")?;
    Ok(())
}

// ============================================================================
// RATE TOGGLE SESSIONS
// ============================================================================

/// Mutex session with a prefix writes a decodable pprof and resets the fraction
#[test]
fn given_mutex_session_when_contended_then_artifact_has_samples_and_fraction_resets() -> TestResult
{
    let _serial = common::serial();
    let out = common::output_dir();

    // GIVEN: A mutex session sampling one in five contentions
    let profiler = Profiler::start(
        Config::new("mutex")
            .with_output_dir(out.path())
            .with_file_prefix("t")
            .with_mutex_profile_fraction(5),
    )?;
    assert_eq!(mutex_profile_fraction(), 5);

    // WHEN: Workers contend on a profiled mutex, then the session stops
    let lock = Arc::new(ProfiledMutex::new(0_u64));
    contend(&lock)?;
    thread::sleep(Duration::from_millis(50));
    let path = profiler.stop()?.ok_or("session had no artifact")?;

    // THEN: One prefixed pprof file exists and carries contention samples
    let name = common::name_of(&path);
    assert!(name.starts_with("t_mutex_"), "unexpected name {name}");
    assert!(name.ends_with(".pprof"), "unexpected name {name}");
    assert_eq!(common::artifacts(out.path()), vec![path.clone()]);

    let profile = common::decode(&path);
    assert!(!profile.sample.is_empty(), "mutex profile has no samples");

    // AND: The process-wide fraction is back to zero
    assert_eq!(mutex_profile_fraction(), 0);
    Ok(())
}

/// Text mode renders the mutex profile as readable text
#[test]
fn given_text_format_when_mutex_session_stops_then_artifact_is_text() -> TestResult {
    let _serial = common::serial();
    let out = common::output_dir();

    let profiler = Profiler::start(
        Config::new("mutex")
            .with_output_dir(out.path())
            .with_text_format(true),
    )?;
    contend(&Arc::new(ProfiledMutex::new(0_u64)))?;
    let path = profiler.stop()?.ok_or("session had no artifact")?;

    assert!(common::name_of(&path).ends_with(".txt"));
    let text = std::fs::read_to_string(&path)?;
    assert!(text.starts_with("--- mutex:"), "unexpected text {text}");
    Ok(())
}

/// Block session raises the block rate and records tracked waits
#[test]
fn given_block_session_when_tracked_wait_then_rate_raised_and_reset() -> TestResult {
    let _serial = common::serial();
    let out = common::output_dir();

    let profiler = Profiler::start(
        Config::new("block")
            .with_output_dir(out.path())
            .with_block_profile_rate(1_000),
    )?;
    assert_eq!(block_profile_rate(), 1_000);

    track_blocking(|| thread::sleep(Duration::from_millis(5)));
    let path = profiler.stop()?.ok_or("session had no artifact")?;

    assert_eq!(block_profile_rate(), 0);
    let profile = common::decode(&path);
    assert!(!profile.sample.is_empty(), "block profile has no samples");
    Ok(())
}

/// Overlapping toggle sessions keep the rate until the last one stops
#[test]
fn given_two_mutex_sessions_when_first_stops_then_rate_survives() -> TestResult {
    let _serial = common::serial();
    let out = common::output_dir();

    let first = Profiler::start(
        Config::new("mutex")
            .with_output_dir(out.path())
            .with_file_prefix("first"),
    )?;
    let second = Profiler::start(
        Config::new("mutex")
            .with_output_dir(out.path())
            .with_file_prefix("second"),
    )?;

    first.stop()?;
    assert_ne!(mutex_profile_fraction(), 0);

    second.stop()?;
    assert_eq!(mutex_profile_fraction(), 0);
    Ok(())
}

// ============================================================================
// STREAMING SESSIONS
// ============================================================================

/// CPU session writes a non-empty, decodable pprof
#[cfg(unix)]
#[test]
fn given_cpu_session_when_work_done_then_pprof_written() -> TestResult {
    let _serial = common::serial();
    let out = common::output_dir();

    let profiler = Profiler::start(Config::new("cpu").with_output_dir(out.path()))?;
    std::hint::black_box(common::spin(200));
    let path = profiler.stop()?.ok_or("session had no artifact")?;

    assert!(common::name_of(&path).starts_with("cpu_"));
    let profile = common::decode(&path);
    assert_eq!(profile.sample_type.len(), 2);
    Ok(())
}

/// A second concurrent CPU session is rejected while the first keeps running
#[cfg(unix)]
#[test]
fn given_running_cpu_session_when_second_starts_then_already_active() -> TestResult {
    let _serial = common::serial();
    let out = common::output_dir();

    let first = Profiler::start(
        Config::new("cpu")
            .with_output_dir(out.path())
            .with_file_prefix("first"),
    )?;

    let second = Profiler::start(
        Config::new("cpu")
            .with_output_dir(out.path())
            .with_file_prefix("second"),
    );
    assert!(matches!(second, Err(ProfilerError::AlreadyActive { ref mode }) if mode == "cpu"));

    let path = first.stop()?.ok_or("session had no artifact")?;
    assert!(std::fs::metadata(path)?.len() > 0);

    // the exclusive claim is released with the first session
    let third = Profiler::start(
        Config::new("cpu")
            .with_output_dir(out.path())
            .with_file_prefix("third"),
    )?;
    third.stop()?;
    Ok(())
}

// ============================================================================
// SNAPSHOT AND SAMPLER SESSIONS
// ============================================================================

/// Goroutine snapshot lists the live threads of the process
#[test]
fn given_goroutine_session_when_stopped_then_live_threads_listed() -> TestResult {
    let _serial = common::serial();
    let out = common::output_dir();

    let profiler = Profiler::start(
        Config::new("goroutine")
            .with_output_dir(out.path())
            .with_text_format(true),
    )?;
    let path = profiler.stop()?.ok_or("session had no artifact")?;

    let text = std::fs::read_to_string(path)?;
    assert!(text.starts_with("--- goroutine:"));
    assert!(text.lines().any(|line| line.contains(" @ ")));
    Ok(())
}

/// Thread creation profile records threads spawned through the registry
#[test]
fn given_spawned_threads_when_thread_create_session_stops_then_sites_recorded() -> TestResult {
    let _serial = common::serial();
    let out = common::output_dir();

    oya_pprof::spawn("creation-site", || ())?
        .join()
        .map_err(|_| "spawned thread panicked")?;

    let profiler = Profiler::start(Config::new("threadcreate").with_output_dir(out.path()))?;
    let path = profiler.stop()?.ok_or("session had no artifact")?;

    assert!(common::name_of(&path).starts_with("thread_create_"));
    let profile = common::decode(&path);
    assert!(!profile.sample.is_empty());
    Ok(())
}

/// Sampling profiler in folded format writes `stack count` lines
#[test]
fn given_folded_sampler_when_stopped_then_folded_lines_written() -> TestResult {
    let _serial = common::serial();
    let out = common::output_dir();

    let profiler = Profiler::start(
        Config::new("fgprof")
            .with_output_dir(out.path())
            .with_sampling_profiler_format(SamplerFormat::Folded),
    )?;
    thread::sleep(Duration::from_millis(100));
    let path = profiler.stop()?.ok_or("session had no artifact")?;

    assert!(common::name_of(&path).starts_with("sampling_profiler_"));
    let text = std::fs::read_to_string(path)?;
    for line in text.lines() {
        let (stack, count) = line.rsplit_once(' ').ok_or("line without count")?;
        assert!(!stack.is_empty());
        assert!(count.parse::<i64>()? > 0);
    }
    Ok(())
}

/// Sampling profiler defaults to binary pprof with a wall-clock period
#[test]
fn given_default_sampler_when_stopped_then_pprof_with_wallclock_period() -> TestResult {
    let _serial = common::serial();
    let out = common::output_dir();

    // GIVEN: A sampling session with no explicit format
    let profiler = Profiler::start(Config::new("sampling_profiler").with_output_dir(out.path()))?;
    let worker = thread::Builder::new()
        .name("sampled-worker".to_owned())
        .spawn(|| thread::sleep(Duration::from_millis(150)))?;

    // WHEN: Stopped after some ticks
    thread::sleep(Duration::from_millis(100));
    let path = profiler.stop()?.ok_or("session had no artifact")?;
    worker.join().map_err(|_| "worker panicked")?;

    // THEN: A decodable pprof file with the wall-clock period type
    let name = common::name_of(&path);
    assert!(name.starts_with("sampling_profiler_"));
    assert!(name.ends_with(".pprof"), "unexpected name {name}");

    let profile = common::decode(&path);
    let period_type = profile.period_type.as_ref().ok_or("no period type")?;
    assert_eq!(common::string_at(&profile, period_type.r#type), "wallclock");
    assert_eq!(common::string_at(&profile, period_type.unit), "nanoseconds");
    assert_eq!(profile.period, 10_101_000);
    assert!(profile.duration_nanos > 0);

    let kinds: Vec<&str> = profile
        .sample_type
        .iter()
        .map(|t| common::string_at(&profile, t.r#type))
        .collect();
    assert_eq!(kinds, vec!["samples", "time"]);
    if cfg!(target_os = "linux") {
        assert!(
            profile.string_table.iter().any(|s| s == "sampled-worker"),
            "worker thread not sampled"
        );
    }
    Ok(())
}

// ============================================================================
// FAILURES AND DISABLED SESSIONS
// ============================================================================

/// Invalid modes never create the output directory
#[test]
fn given_invalid_mode_when_started_then_no_file_created() {
    let out = common::output_dir();
    let dir = out.path().join("never");

    let result = Profiler::start(Config::new("wallclock").with_output_dir(&dir));

    assert!(
        matches!(result, Err(ProfilerError::InvalidMode { ref mode }) if mode == "wallclock")
    );
    assert!(!dir.exists());
}

/// Disabled sessions leave the process rates untouched
#[test]
fn given_disabled_mutex_session_when_run_then_nothing_changes() -> TestResult {
    let _serial = common::serial();
    let out = common::output_dir();

    let profiler = Profiler::start(
        Config::new("mutex")
            .with_output_dir(out.path())
            .disabled(true),
    )?;
    assert_eq!(mutex_profile_fraction(), 0);
    assert_eq!(profiler.stop()?, None);
    assert!(common::artifacts(out.path()).is_empty());
    Ok(())
}

/// Unwritable output directories surface as a directory creation error
#[test]
fn given_output_dir_under_a_file_when_started_then_directory_creation_error() -> TestResult {
    let out = common::output_dir();
    let blocker = out.path().join("blocker");
    std::fs::write(&blocker, b"not a directory")?;

    let result = Profiler::start(Config::new("heap").with_output_dir(blocker.join("nested")));

    assert!(matches!(
        result,
        Err(ProfilerError::DirectoryCreation { .. })
    ));
    Ok(())
}

// ============================================================================
// SIGNAL-DRIVEN STOP
// ============================================================================

/// run_until stops the session when the timer fires
#[tokio::test]
async fn given_timer_signal_when_run_until_then_artifact_written() -> TestResult {
    let _serial = common::serial();
    let out = common::output_dir();

    let profiler = Profiler::start(Config::new("heap").with_output_dir(out.path()))?;
    let path = profiler
        .run_until(tokio::time::sleep(Duration::from_millis(20)))
        .await?
        .ok_or("session had no artifact")?;

    assert!(common::name_of(&path).starts_with("heap_"));
    assert!(!common::decode(&path).sample.is_empty());
    Ok(())
}

/// run stops when a oneshot channel fires
#[tokio::test]
async fn given_oneshot_signal_when_run_then_session_stops() -> TestResult {
    let _serial = common::serial();
    let out = common::output_dir();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let session = tokio::spawn(oya_pprof::run(
        Config::new("allocs").with_output_dir(out.path().to_path_buf()),
        async move {
            let _ = rx.await;
        },
    ));
    tokio::time::sleep(Duration::from_millis(10)).await;
    tx.send(()).map_err(|()| "session ended early")?;

    let path = session.await??.ok_or("session had no artifact")?;
    assert!(common::name_of(&path).starts_with("allocs_"));
    Ok(())
}

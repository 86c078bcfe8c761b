//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code waits on I/O, timers with a purpose
//! (`tokio::time::timeout`, `tokio::time::interval`) or cancellation. It never
//! sleeps to pass time.
//! **Exceptions**: the scripted engine, which replays replies with the delays
//! a test asks for; test code.

use architectural_enforcement::{production_sources, report, scan};

/// Files allowed to call `tokio::time::sleep`
const SLEEP_ALLOWED: &[&str] = &["engine/scripted.rs"];

#[test]
fn test_no_thread_sleep_in_production_code() {
    let violations = scan(&production_sources(), |_, _, code| {
        code.contains("thread::sleep")
    });
    report("std::thread::sleep blocks a runtime worker", &violations);
}

#[test]
fn test_no_async_sleep_outside_allowed_files() {
    let violations = scan(&production_sources(), |source, _, code| {
        code.contains("time::sleep")
            && !SLEEP_ALLOWED
                .iter()
                .any(|allowed| source.path_ends_with(allowed))
    });
    report(
        "tokio::time::sleep outside the scripted engine (use timeout or interval)",
        &violations,
    );
}

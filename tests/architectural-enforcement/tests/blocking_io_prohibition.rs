//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: async functions in production code must not block the runtime.
//! **Required**: `tokio::process`, `tokio::net`, `tokio::io`; SQLite calls go
//! through `tokio::task::spawn_blocking`.
//! **Acceptable**: blocking calls in plain `fn`s that run before the runtime
//! serves requests (configuration loading) or on the blocking pool.

use architectural_enforcement::{production_sources, report, scan};

const BLOCKING_PATTERNS: &[&str] = &[
    "std::fs::",
    "std::net::TcpStream",
    "std::net::TcpListener",
    "std::process::Command",
    "std::io::stdin()",
    "reqwest::blocking",
];

#[test]
fn test_no_blocking_io_in_async_functions() {
    let violations = scan(&production_sources(), |source, idx, code| {
        BLOCKING_PATTERNS.iter().any(|p| code.contains(p)) && source.is_in_async_fn(idx)
    });
    report("Blocking I/O inside an async fn", &violations);
}

#[test]
fn test_engine_processes_use_tokio() {
    let violations = scan(&production_sources(), |_, _, code| {
        code.contains("std::process::Command")
    });
    report(
        "Engine processes must be spawned with tokio::process::Command",
        &violations,
    );
}

#[test]
fn test_store_calls_from_chat_run_on_blocking_pool() {
    // ChatService reaches the store only through its `on_store` helper
    let violations = scan(&production_sources(), |source, _, code| {
        source.path_ends_with("core/src/chat.rs")
            && code.contains("self.store.")
            && !code.contains("self.store.clone()")
    });
    report(
        "ChatService must call the store via spawn_blocking",
        &violations,
    );
}

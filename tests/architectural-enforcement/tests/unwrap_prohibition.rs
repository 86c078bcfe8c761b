//! Integration Test: Unwrap Prohibition
//!
//! **Policy**: production code propagates errors with `?` and typed errors
//! (`thiserror` in the library, `anyhow` in the daemon). `unwrap()` and
//! `expect()` are for tests only.

use architectural_enforcement::{production_sources, report, scan};

#[test]
fn test_no_unwrap_in_production_code() {
    let violations = scan(&production_sources(), |_, _, code| {
        code.contains(".unwrap()") || code.contains(".expect(")
    });
    report("unwrap()/expect() in production code", &violations);
}

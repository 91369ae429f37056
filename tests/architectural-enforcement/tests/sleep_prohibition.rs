//! Integration Test: Sleep Prohibition
//!
//! **Policy**: engine code MUST NOT call sleep methods.
//! **Exceptions**: backoff delays before a retry or reconnect, test code.

use architectural_enforcement::{engine_src, scan_directory, SleepPolicy};

#[test]
fn test_no_sleep_in_engine_code() {
    let src = engine_src();
    assert!(src.exists(), "engine sources not found at {}", src.display());

    let violations = scan_directory(
        &src,
        SleepPolicy {
            allow_backoff: true,
            allow_tests: true,
        },
    );

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in engine code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nAcceptable sleep uses:");
        eprintln!("  - Backoff delay computed by RetryPolicy before a retry/reconnect");
        eprintln!("  - Test code (#[test] or #[tokio::test] functions)");
        eprintln!("\nUse tokio::time::interval for periodic work and async I/O to wait for events.");

        panic!("Found {} sleep violation(s) in engine code", violations.len());
    }
}

#[test]
fn test_backoff_sleeps_are_the_only_sleeps() {
    let strict = scan_directory(
        &engine_src(),
        SleepPolicy {
            allow_backoff: false,
            allow_tests: true,
        },
    );

    // Request retry in the session and stream reconnect in the manager.
    assert_eq!(strict.len(), 2, "unexpected sleeps: {strict:?}");
    assert!(strict
        .iter()
        .all(|v| v.path.ends_with("manager.rs") || v.path.ends_with("session/mod.rs")));
}

//! Architectural Enforcement
//!
//! Source scanners behind the workspace's architecture tests:
//! - No sleep() in engine code except backoff delays before a retry or
//!   reconnect
//! - Periodic work uses `tokio::time::interval`, never a sleep loop
//!
//! The engine's only suspension points are connection I/O, buffer reads and
//! backoff delays; a sleep anywhere else hides a missing wake-up.

use std::fs;
use std::path::{Path, PathBuf};

/// Lines scanned above a sleep for its backoff calculation
const BACKOFF_LOOKBACK: usize = 30;

/// What a scanned directory may contain
#[derive(Clone, Copy, Debug)]
pub struct SleepPolicy {
    /// Allow sleeps whose delay comes from the backoff policy
    pub allow_backoff: bool,
    /// Allow sleeps inside `#[test]` / `#[tokio::test]` functions
    pub allow_tests: bool,
}

/// A forbidden sleep
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    /// File containing it
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Offending source line, trimmed
    pub source: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.source)
    }
}

/// Root of the engine crate's sources
#[must_use]
pub fn engine_src() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../stream/core/src")
}

/// Scan every `.rs` file under `dir`
#[must_use]
pub fn scan_directory(dir: &Path, policy: SleepPolicy) -> Vec<Violation> {
    let mut violations = Vec::new();
    if !dir.exists() {
        return violations;
    }

    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
    {
        if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
            if let Ok(content) = fs::read_to_string(entry.path()) {
                violations.extend(scan_source(entry.path(), &content, policy));
            }
        }
    }
    violations
}

/// Scan one file's contents
#[must_use]
pub fn scan_source(path: &Path, content: &str, policy: SleepPolicy) -> Vec<Violation> {
    let lines: Vec<&str> = content.lines().collect();
    let mut violations = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let code_part = line.split("//").next().unwrap_or(line);
        if !(code_part.contains("::sleep(") || code_part.contains(".sleep(")) {
            continue;
        }
        if policy.allow_tests && is_in_test_function(&lines, idx) {
            continue;
        }
        if policy.allow_backoff && is_backoff_context(&lines, idx) {
            continue;
        }
        violations.push(Violation {
            path: path.to_path_buf(),
            line: idx + 1,
            source: line.trim().to_string(),
        });
    }
    violations
}

/// Whether the line sits inside a test function
#[must_use]
pub fn is_in_test_function(lines: &[&str], current_idx: usize) -> bool {
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();

        if line.starts_with("#[test]") || line.starts_with("#[tokio::test") {
            return true;
        }
        let is_fn = line.starts_with("fn ")
            || line.starts_with("async fn ")
            || line.starts_with("pub fn ")
            || line.starts_with("pub async fn ");
        if is_fn && !line.contains("test") {
            return false;
        }
        if line.starts_with("mod ") || line.starts_with("impl ") {
            return false;
        }
    }
    false
}

/// Whether the sleep waits out a backoff delay before a retry or reconnect
///
/// Requires both a delay computed by the backoff policy (`delay_for` or
/// `next_delay`) and retry vocabulary nearby.
#[must_use]
pub fn is_backoff_context(lines: &[&str], current_idx: usize) -> bool {
    let start = current_idx.saturating_sub(BACKOFF_LOOKBACK);
    let end = (current_idx + 5).min(lines.len());

    let mut has_backoff_calc = false;
    let mut has_retry_context = false;

    for line in &lines[start..end] {
        let line = line.to_lowercase();
        if line.contains("delay_for(") || line.contains("next_delay(") {
            has_backoff_calc = true;
        }
        if line.contains("retry") || line.contains("reconnect") || line.contains("attempt") {
            has_retry_context = true;
        }
    }

    has_backoff_calc && has_retry_context
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRICT: SleepPolicy = SleepPolicy {
        allow_backoff: true,
        allow_tests: false,
    };

    #[test]
    fn test_polling_sleep_is_flagged() {
        let code = "async fn poll() {\n    loop {\n        tokio::time::sleep(Duration::from_millis(10)).await;\n    }\n}\n";
        let violations = scan_source(Path::new("poll.rs"), code, STRICT);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line, 3);
    }

    #[test]
    fn test_backoff_sleep_is_allowed() {
        let lines = vec![
            "async fn reconnect() {",
            "    attempt += 1;",
            "    let delay = policy.delay_for(attempt);",
            "    tracing::info!(attempt, \"Reconnecting\");",
            "    tokio::time::sleep(delay).await;",
            "}",
        ];
        assert!(is_backoff_context(&lines, 4));
    }

    #[test]
    fn test_fixed_delay_is_not_backoff() {
        let lines = vec![
            "async fn retry_later() {",
            "    tokio::time::sleep(Duration::from_secs(1)).await;",
            "}",
        ];
        assert!(!is_backoff_context(&lines, 1));
    }

    #[test]
    fn test_test_function_detection() {
        let lines = vec![
            "#[tokio::test]",
            "async fn test_wait() {",
            "    tokio::time::sleep(Duration::from_millis(5)).await;",
            "}",
        ];
        assert!(is_in_test_function(&lines, 2));
        assert!(!is_in_test_function(&["fn run() {", "    sleep();"], 1));
    }

    #[test]
    fn test_commented_sleep_ignored() {
        let code = "fn f() {\n    // tokio::time::sleep(d).await;\n}\n";
        assert!(scan_source(Path::new("f.rs"), code, STRICT).is_empty());
    }
}

//! Audit Trail
//!
//! One log line per tool invocation, emitted through `tracing` on the
//! `audit` target. The line carries the tool name, a bounded excerpt of
//! the arguments, the outcome, and the wall-clock duration; timestamp
//! and level come from the subscriber's standard format.
//!
//! Logging goes to stderr so the stdio transport keeps stdout clean.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;

/// Longest argument excerpt carried on an audit line.
const EXCERPT_LEN: usize = 200;

static ENABLED: AtomicBool = AtomicBool::new(true);

/// Flip the audit trail on or off. Set once at startup.
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

/// Bounded single-line rendering of a tool's arguments.
#[must_use]
pub fn arg_excerpt(args: &Value) -> String {
    let mut text = args.to_string().replace(['\n', '\r'], " ");
    if text.len() > EXCERPT_LEN {
        let mut end = EXCERPT_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str("...");
    }
    text
}

/// Record one tool invocation.
pub fn record(tool: &str, excerpt: &str, success: bool, duration: Duration) {
    if !ENABLED.load(Ordering::Relaxed) {
        return;
    }
    let duration_ms = duration.as_secs_f64() * 1000.0;
    tracing::info!(
        target: "audit",
        "[AUDIT] {tool} | query=\"{excerpt}\" | success={success} | duration_ms={duration_ms:.2}"
    );
}

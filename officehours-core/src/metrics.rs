// ABOUTME: Metric helpers for queue and help-session activity.
// ABOUTME: No-ops until the binary installs a recorder (e.g. the Prometheus exporter).

use metrics::{counter, gauge, histogram};

pub fn record_enqueue(queue: &str) {
    counter!("officehours_enqueue_total", "queue" => queue.to_string()).increment(1);
}

/// `kind` is "first", "specific", or "claim"
pub fn record_dequeue(queue: &str, kind: &'static str) {
    counter!("officehours_dequeue_total", "queue" => queue.to_string(), "kind" => kind)
        .increment(1);
}

pub fn record_leave(queue: &str) {
    counter!("officehours_leave_total", "queue" => queue.to_string()).increment(1);
}

/// `trigger` is "manual" or "auto"
pub fn record_clear(queue: &str, trigger: &'static str, removed: usize) {
    counter!("officehours_clear_total", "queue" => queue.to_string(), "trigger" => trigger)
        .increment(1);
    counter!("officehours_cleared_waiters_total", "queue" => queue.to_string())
        .increment(removed as u64);
}

pub fn set_queue_length(queue: &str, len: usize) {
    gauge!("officehours_queue_length", "queue" => queue.to_string()).set(len as f64);
}

pub fn set_active_helpers(count: usize) {
    gauge!("officehours_active_helpers").set(count as f64);
}

pub fn record_helper_started() {
    counter!("officehours_helper_sessions_started_total").increment(1);
}

pub fn record_helper_stopped(active_time_ms: i64) {
    counter!("officehours_helper_sessions_stopped_total").increment(1);
    histogram!("officehours_helper_active_seconds").record(active_time_ms as f64 / 1000.0);
}

pub fn record_help_session(wait_time_ms: i64, duration_ms: i64) {
    counter!("officehours_help_sessions_total").increment(1);
    histogram!("officehours_wait_seconds").record(wait_time_ms as f64 / 1000.0);
    histogram!("officehours_help_session_seconds").record(duration_ms as f64 / 1000.0);
}

pub fn record_usage_error(kind: &'static str) {
    counter!("officehours_usage_errors_total", "kind" => kind).increment(1);
}

pub fn record_extension_failure(event: &'static str) {
    counter!("officehours_extension_failures_total", "event" => event).increment(1);
}

pub fn record_snapshot_failure() {
    counter!("officehours_snapshot_failures_total").increment(1);
}

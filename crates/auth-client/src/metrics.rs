//! Refresh coordinator metrics
//!
//! - `auth_refresh_total` (counter): label `outcome`
//! - `auth_refresh_waiters_total` (counter): requests that queued behind an in-flight refresh
//! - `auth_session_teardowns_total` (counter)
//!
//! Calls are no-ops until the embedding binary installs a recorder.

/// Record a settled refresh attempt.
pub fn record_refresh(outcome: &'static str) {
    metrics::counter!("auth_refresh_total", "outcome" => outcome).increment(1);
}

/// Record a request parked behind an in-flight refresh.
pub fn record_waiter() {
    metrics::counter!("auth_refresh_waiters_total").increment(1);
}

/// Record a forced logout.
pub fn record_teardown() {
    metrics::counter!("auth_session_teardowns_total").increment(1);
}

//! Request telemetry.
//!
//! Counts accepted connections and successful string responses, and
//! remembers when the server started. Counters are atomic so a reporting
//! thread can read them while the accept loop updates them.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Process-wide request counters.
#[derive(Debug)]
pub struct Telemetry {
    request_count: AtomicU64,
    ok_response_count: AtomicU64,
    start_time: DateTime<Utc>,
    started: Instant,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub request_count: u64,
    pub ok_response_count: u64,
    pub start_time: DateTime<Utc>,
    pub uptime: Duration,
}

impl Telemetry {
    /// Capture the start time and zero both counters.
    pub fn init() -> Arc<Self> {
        let start_time = Utc::now();
        debug!(%start_time, "Telemetry initialized");
        Arc::new(Self {
            request_count: AtomicU64::new(0),
            ok_response_count: AtomicU64::new(0),
            start_time,
            started: Instant::now(),
        })
    }

    /// Called once per accepted connection, before it is handled.
    pub fn increment_request_count(&self) {
        self.request_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Called once per string response fully written to a client.
    pub fn increment_ok_response_count(&self) {
        self.ok_response_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn ok_response_count(&self) -> u64 {
        self.ok_response_count.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            request_count: self.request_count(),
            ok_response_count: self.ok_response_count(),
            start_time: self.start_time,
            uptime: self.started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_init_zeroes_counters() {
        let before = Utc::now();
        let telemetry = Telemetry::init();
        assert_eq!(telemetry.request_count(), 0);
        assert_eq!(telemetry.ok_response_count(), 0);
        assert!(telemetry.start_time() >= before);
        assert!(telemetry.start_time() <= Utc::now());
    }

    #[test]
    fn test_counters_are_independent() {
        let telemetry = Telemetry::init();
        telemetry.increment_request_count();
        telemetry.increment_request_count();
        telemetry.increment_ok_response_count();

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.ok_response_count, 1);
        assert_eq!(snapshot.start_time, telemetry.start_time());
    }

    #[test]
    fn test_concurrent_increments() {
        let telemetry = Telemetry::init();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let telemetry = Arc::clone(&telemetry);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        telemetry.increment_request_count();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(telemetry.request_count(), 4000);
        assert_eq!(telemetry.ok_response_count(), 0);
    }

    #[test]
    fn test_reads_have_no_side_effects() {
        let telemetry = Telemetry::init();
        telemetry.increment_request_count();
        for _ in 0..3 {
            assert_eq!(telemetry.request_count(), 1);
            assert_eq!(telemetry.snapshot().request_count, 1);
        }
    }
}

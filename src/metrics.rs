//! Metrics collection for the range relay
//!
//! Lock-free counters shared by every request task.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics collector for the range relay
#[derive(Debug, Default)]
pub struct RelayMetrics {
    // Request statistics
    total_requests: AtomicU64,
    completed_requests: AtomicU64,
    failed_requests: AtomicU64,
    declined_requests: AtomicU64,
    range_rejected_requests: AtomicU64,

    // Fetch statistics
    total_fetches: AtomicU64,
    failed_fetches: AtomicU64,
    resumed_fetches: AtomicU64,
    redirects_followed: AtomicU64,

    bytes_to_client: AtomicU64,

    // Latency (microseconds)
    total_request_duration_us: AtomicU64,
    total_fetch_duration_us: AtomicU64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub declined_requests: u64,
    pub range_rejected_requests: u64,

    pub total_fetches: u64,
    pub failed_fetches: u64,
    pub resumed_fetches: u64,
    pub redirects_followed: u64,

    pub bytes_to_client: u64,

    pub total_request_duration_us: u64,
    pub total_fetch_duration_us: u64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the end of a client request
    ///
    /// # Arguments
    /// * `status` - Status presented to the client
    /// * `complete` - Whether every requested byte was relayed
    pub fn record_request(&self, status: u16, complete: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if complete {
            self.completed_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
            if status == 416 {
                self.range_rejected_requests.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record a request the relay is not configured for
    pub fn record_declined(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.declined_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch(&self, success: bool) {
        self.total_fetches.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_fetches.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_resume(&self) {
        self.resumed_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_redirect(&self) {
        self.redirects_followed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_to_client(&self, bytes: u64) {
        self.bytes_to_client.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_request_duration(&self, duration: Duration) {
        self.total_request_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_fetch_duration(&self, duration: Duration) {
        self.total_fetch_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    ///
    /// Fields are loaded independently, so a snapshot taken under load may
    /// not be consistent across counters.
    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            declined_requests: self.declined_requests.load(Ordering::Relaxed),
            range_rejected_requests: self.range_rejected_requests.load(Ordering::Relaxed),
            total_fetches: self.total_fetches.load(Ordering::Relaxed),
            failed_fetches: self.failed_fetches.load(Ordering::Relaxed),
            resumed_fetches: self.resumed_fetches.load(Ordering::Relaxed),
            redirects_followed: self.redirects_followed.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            total_request_duration_us: self.total_request_duration_us.load(Ordering::Relaxed),
            total_fetch_duration_us: self.total_fetch_duration_us.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        for counter in [
            &self.total_requests,
            &self.completed_requests,
            &self.failed_requests,
            &self.declined_requests,
            &self.range_rejected_requests,
            &self.total_fetches,
            &self.failed_fetches,
            &self.resumed_fetches,
            &self.redirects_followed,
            &self.bytes_to_client,
            &self.total_request_duration_us,
            &self.total_fetch_duration_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl MetricsSnapshot {
    /// Average request duration in milliseconds
    pub fn avg_request_duration_ms(&self) -> f64 {
        let served = self.completed_requests + self.failed_requests;
        if served == 0 {
            0.0
        } else {
            (self.total_request_duration_us as f64 / served as f64) / 1000.0
        }
    }

    /// Average fetch duration in milliseconds
    pub fn avg_fetch_duration_ms(&self) -> f64 {
        if self.total_fetches == 0 {
            0.0
        } else {
            (self.total_fetch_duration_us as f64 / self.total_fetches as f64) / 1000.0
        }
    }

    /// Fetch failure rate as a percentage (0.0 to 100.0)
    pub fn fetch_failure_rate(&self) -> f64 {
        if self.total_fetches == 0 {
            0.0
        } else {
            (self.failed_fetches as f64 / self.total_fetches as f64) * 100.0
        }
    }

    /// Average fetches issued per served request
    pub fn fetches_per_request(&self) -> f64 {
        let served = self.completed_requests + self.failed_requests;
        if served == 0 {
            0.0
        } else {
            self.total_fetches as f64 / served as f64
        }
    }
}

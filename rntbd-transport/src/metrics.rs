//! Per-endpoint counters and the per-request recorder seam.
//!
//! Counters and gauges are lock-free and may be read from any thread; the
//! pool gauges are refreshed by the pool worker and are advisory only.

use {
    crate::{
        frame::{OperationType, ResourceType},
        record::RequestTimeline,
    },
    std::sync::atomic::{AtomicI64, AtomicU64, Ordering},
    uuid::Uuid,
};

// ---------------------------------------------------------------------------
// Metric primitives
// ---------------------------------------------------------------------------

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Add a value to the counter.
    pub fn add(&self, v: u64) {
        self.value.fetch_add(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge that can go up or down.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub const fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }

    /// Set the gauge to an absolute value.
    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Endpoint metrics
// ---------------------------------------------------------------------------

/// Counters of one endpoint, polled by external telemetry.
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    pub requests: Counter,
    pub completed: Counter,
    pub failed: Counter,
    pub bytes_written: Counter,
    pub bytes_read: Counter,
    pub channels_opened: Counter,
    pub channels_closed: Counter,
    pub concurrent_requests: Gauge,
    pub available_channels: Gauge,
    pub acquired_channels: Gauge,
    pub pending_acquisitions: Gauge,
}

/// Point-in-time copy of [`EndpointMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointMetricsSnapshot {
    pub requests: u64,
    pub completed: u64,
    pub failed: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub channels_opened: u64,
    pub channels_closed: u64,
    pub concurrent_requests: i64,
    pub available_channels: i64,
    pub acquired_channels: i64,
    pub pending_acquisitions: i64,
}

impl EndpointMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> EndpointMetricsSnapshot {
        EndpointMetricsSnapshot {
            requests: self.requests.get(),
            completed: self.completed.get(),
            failed: self.failed.get(),
            bytes_written: self.bytes_written.get(),
            bytes_read: self.bytes_read.get(),
            channels_opened: self.channels_opened.get(),
            channels_closed: self.channels_closed.get(),
            concurrent_requests: self.concurrent_requests.get(),
            available_channels: self.available_channels.get(),
            acquired_channels: self.acquired_channels.get(),
            pending_acquisitions: self.pending_acquisitions.get(),
        }
    }
}

// ---------------------------------------------------------------------------
// Request recorder
// ---------------------------------------------------------------------------

/// Everything known about a request once it completes.
#[derive(Debug, Clone)]
pub struct RequestCompletion {
    pub address: String,
    pub activity_id: Uuid,
    pub transport_request_id: u32,
    pub operation_type: OperationType,
    pub resource_type: ResourceType,
    /// Response status, when a response arrived.
    pub status: Option<u16>,
    /// Rendered error, when the request failed.
    pub error: Option<String>,
    pub request_bytes: usize,
    pub response_bytes: usize,
    pub timeline: RequestTimeline,
}

/// Receives one [`RequestCompletion`] per request.
///
/// Called on the completing task; implementations should hand off anything
/// expensive.
pub trait RequestMetricsRecorder: Send + Sync + 'static {
    fn record(&self, completion: &RequestCompletion);
}

/// Discards every completion.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl RequestMetricsRecorder for NoopRecorder {
    fn record(&self, _completion: &RequestCompletion) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new();
        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);

        let gauge = Gauge::new();
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
        gauge.set(-3);
        assert_eq!(gauge.get(), -3);
    }

    #[test]
    fn test_snapshot_copies_values() {
        let metrics = EndpointMetrics::new();
        metrics.requests.add(3);
        metrics.failed.inc();
        metrics.acquired_channels.set(2);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 3);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.acquired_channels, 2);
        assert_eq!(snapshot.completed, 0);
    }
}

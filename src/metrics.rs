//! Metrics collection for the orchestrator
//!
//! Thread-safe counters updated with relaxed atomics. They track calls and
//! their outcomes plus the work each feature saved or added.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics collector for one orchestrator
#[derive(Debug, Default)]
pub struct OrchestratorMetrics {
    // Call outcomes
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,

    // Cache
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    // Transport and retry
    transport_sends: AtomicU64,
    retries: AtomicU64,
    recoveries: AtomicU64,

    // Coalescing and protection
    dedup_joins: AtomicU64,
    debounced_calls: AtomicU64,
    circuit_rejections: AtomicU64,

    // Latency (stored as microseconds)
    total_call_duration_us: AtomicU64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,

    pub cache_hits: u64,
    pub cache_misses: u64,

    pub transport_sends: u64,
    pub retries: u64,
    pub recoveries: u64,

    pub dedup_joins: u64,
    pub debounced_calls: u64,
    pub circuit_rejections: u64,

    pub total_call_duration_us: u64,
}

impl OrchestratorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished call
    ///
    /// # Arguments
    /// * `success` - Whether the caller received a value
    /// * `duration` - Time from `call` to its result
    pub fn record_call(&self, success: bool, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
        self.total_call_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_send(&self) {
        self.transport_sends.fetch_add(1, Ordering::Relaxed);
    }

    /// Record retries made beyond the first attempt
    pub fn record_retries(&self, count: u64) {
        if count > 0 {
            self.retries.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dedup_join(&self) {
        self.dedup_joins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_debounced(&self) {
        self.debounced_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    ///
    /// Fields are loaded one by one, so a snapshot taken under load may not
    /// be perfectly consistent across fields.
    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            transport_sends: self.transport_sends.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            dedup_joins: self.dedup_joins.load(Ordering::Relaxed),
            debounced_calls: self.debounced_calls.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            total_call_duration_us: self.total_call_duration_us.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        self.total_calls.store(0, Ordering::Relaxed);
        self.successful_calls.store(0, Ordering::Relaxed);
        self.failed_calls.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.transport_sends.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.recoveries.store(0, Ordering::Relaxed);
        self.dedup_joins.store(0, Ordering::Relaxed);
        self.debounced_calls.store(0, Ordering::Relaxed);
        self.circuit_rejections.store(0, Ordering::Relaxed);
        self.total_call_duration_us.store(0, Ordering::Relaxed);
    }
}

impl MetricsSnapshot {
    /// Cache hit rate as a percentage (0.0 to 100.0)
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            (self.cache_hits as f64 / total as f64) * 100.0
        }
    }

    /// Average call duration in milliseconds
    pub fn avg_call_duration_ms(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            (self.total_call_duration_us as f64 / self.total_calls as f64) / 1000.0
        }
    }

    /// Failed calls as a percentage (0.0 to 100.0)
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            (self.failed_calls as f64 / self.total_calls as f64) * 100.0
        }
    }

    /// Transport sends per call; below 1.0 when features absorb calls
    pub fn sends_per_call(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.transport_sends as f64 / self.total_calls as f64
        }
    }
}

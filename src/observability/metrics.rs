//! Pipeline counters
//!
//! - Counters only, monotonic
//! - Shared through `Arc` by every enumerator built from one config
//! - Relaxed atomics; values are exact once all pulls have returned

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters for one pipeline (or a family sharing a registry)
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pages_fetched: AtomicU64,
    elements_returned: AtomicU64,
    /// Request charge in thousandths of a unit
    request_charge_milli: AtomicU64,
    splits: AtomicU64,
    merges: AtomicU64,
    /// Logical partition keys found in a different partition
    relocations: AtomicU64,
    ranges_exhausted: AtomicU64,
    fetch_failures: AtomicU64,
    tokens_rejected: AtomicU64,
}

impl PipelineMetrics {
    /// Create a registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one successful physical fetch
    pub fn record_page(&self, elements: usize, request_charge: f64) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
        self.elements_returned
            .fetch_add(elements as u64, Ordering::Relaxed);
        let milli = (request_charge.max(0.0) * 1000.0).round() as u64;
        self.request_charge_milli.fetch_add(milli, Ordering::Relaxed);
    }

    pub fn increment_splits(&self) {
        self.splits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_merges(&self) {
        self.merges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_relocations(&self) {
        self.relocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_ranges_exhausted(&self) {
        self.ranges_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_fetch_failures(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_tokens_rejected(&self) {
        self.tokens_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get all counters as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            elements_returned: self.elements_returned.load(Ordering::Relaxed),
            request_charge_milli: self.request_charge_milli.load(Ordering::Relaxed),
            splits: self.splits.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            relocations: self.relocations.load(Ordering::Relaxed),
            ranges_exhausted: self.ranges_exhausted.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            tokens_rejected: self.tokens_rejected.load(Ordering::Relaxed),
        }
    }

    /// Current counters as a JSON object
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A point-in-time snapshot of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub pages_fetched: u64,
    pub elements_returned: u64,
    pub request_charge_milli: u64,
    pub splits: u64,
    pub merges: u64,
    pub relocations: u64,
    pub ranges_exhausted: u64,
    pub fetch_failures: u64,
    pub tokens_rejected: u64,
}

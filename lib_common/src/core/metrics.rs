//! Fixed-size sample rings backing the operator metrics.
//!
//! `LatencyRing` holds the end-to-end latencies reported back by client
//! acks; `SendTimes` holds one client's recent socket write durations.
//! Both discard the oldest sample once full. Neither feeds the eviction
//! policy; they exist for reporting only.

use std::collections::VecDeque;

/// Capacity of the global end-to-end latency ring.
pub const E2E_RING_CAPACITY: usize = 1000;

/// Capacity of the per-client send-duration ring.
pub const SEND_TIMES_CAPACITY: usize = 100;

/// Ring of end-to-end latency samples in milliseconds.
pub struct LatencyRing {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl LatencyRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "latency ring capacity must be at least 1");
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, latency_ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Percentile by sort-and-index. Returns 0.0 with no samples.
    pub fn percentile(&self, pct: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((sorted.len() as f64 * pct) as usize).min(sorted.len() - 1);
        sorted[idx]
    }

    pub fn p50(&self) -> f64 {
        self.percentile(0.50)
    }

    pub fn p95(&self) -> f64 {
        self.percentile(0.95)
    }
}

/// Ring of one client's recent socket write durations in milliseconds.
pub struct SendTimes {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl SendTimes {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "send times capacity must be at least 1");
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, duration_ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(duration_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Mean of the retained samples, 0.0 when empty.
    pub fn mean_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

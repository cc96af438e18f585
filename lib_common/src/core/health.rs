//! # Slow-Client Eviction Policy
//!
//! Two orthogonal symptoms, either one evicts: too many drops inside a
//! sliding ten second window ("consistently too slow"), or a queue that has
//! stayed continuously full past a configured timeout ("completely
//! stalled").
//!
//! The policy is a pure function of the per-client counters and the current
//! time. It is evaluated by the broadcaster after every enqueue attempt, so
//! all mutation happens on the broadcast path and needs no extra
//! synchronization.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::core::relay_queue::PushOutcome;

/// Width of the sliding drop window consulted by the eviction policy.
pub const DROP_WINDOW: Duration = Duration::from_secs(10);

/// Eviction thresholds, fixed at dispatcher construction.
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    /// Evict when more than this many drops landed inside [`DROP_WINDOW`].
    pub drop_limit: usize,
    /// Evict when the queue has been continuously full for longer than this.
    pub full_timeout: Duration,
}

/// Why a client was voted out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// The drop window exceeded the configured limit.
    DropRate,
    /// The queue stayed full past the configured timeout.
    StuckFull,
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictReason::DropRate => write!(f, "drop rate over limit"),
            EvictReason::StuckFull => write!(f, "queue stuck full"),
        }
    }
}

/// Verdict of one policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Evict(EvictReason),
}

/// Per-client drop bookkeeping, mutated only from the broadcast pass.
#[derive(Debug, Default)]
pub struct ClientHealth {
    drops_total: u64,
    last_drop_window: VecDeque<Instant>,
    queue_full_since: Option<Instant>,
}

impl ClientHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds the outcome of one enqueue attempt into the counters.
    ///
    /// A successful enqueue proves the queue was not full, which resets the
    /// continuous-full clock. A displacement counts as one drop, lands in
    /// the sliding window, and starts the continuous-full clock if it is not
    /// already running.
    pub fn record_enqueue(&mut self, outcome: PushOutcome, now: Instant) {
        match outcome {
            PushOutcome::Enqueued => self.queue_full_since = None,
            PushOutcome::Displaced => {
                self.drops_total += 1;
                self.last_drop_window.push_back(now);
                if self.queue_full_since.is_none() {
                    self.queue_full_since = Some(now);
                }
            }
        }
    }

    /// Evaluates the policy. Prunes window entries older than
    /// [`DROP_WINDOW`] before counting, so stale drops never count toward
    /// the limit.
    pub fn verdict(&mut self, policy: &HealthPolicy, now: Instant) -> Verdict {
        while let Some(oldest) = self.last_drop_window.front() {
            if now.duration_since(*oldest) > DROP_WINDOW {
                self.last_drop_window.pop_front();
            } else {
                break;
            }
        }

        if self.last_drop_window.len() > policy.drop_limit {
            return Verdict::Evict(EvictReason::DropRate);
        }
        if let Some(since) = self.queue_full_since {
            if now.duration_since(since) > policy.full_timeout {
                return Verdict::Evict(EvictReason::StuckFull);
            }
        }
        Verdict::Healthy
    }

    /// Cumulative drops since admission.
    pub fn drops_total(&self) -> u64 {
        self.drops_total
    }

    /// Start of the current uninterrupted full run, if any.
    pub fn queue_full_since(&self) -> Option<Instant> {
        self.queue_full_since
    }

    /// Drops currently retained in the sliding window.
    pub fn recent_drops(&self) -> usize {
        self.last_drop_window.len()
    }
}

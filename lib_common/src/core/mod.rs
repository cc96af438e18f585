//! # Core Engine Module
//!
//! This module forms the heart of the broadcast fanout engine. It aggregates
//! the components required for publishing one synthetic stream to many
//! WebSocket subscribers without letting a slow subscriber stall the rest.
//!
//! ## Core Components:
//!
//! - **`dispatcher`**: The central broadcaster. It owns the client registry
//!   and fans each serialized envelope out to every registered client, either
//!   by sequential socket writes (naive strategy) or through per-client
//!   bounded queues drained by relay workers (isolated strategy).
//!
//! - **`relay_queue`**: The bounded per-client frame queue with drop-oldest
//!   overflow. When a client cannot keep up, the oldest retained frame is
//!   discarded so the client resumes with the most recent data.
//!
//! - **`health`**: The eviction policy for slow clients. It watches a sliding
//!   window of recent drops and the time a queue has been continuously full,
//!   and votes a client out when either symptom crosses its threshold.
//!
//! - **`metrics`**: Fixed-size sample rings backing the operator metrics:
//!   end-to-end latency from client acks and recent socket write durations.
//!
//! The `servers` crate drives these components from its publisher loop and
//! wires them to the actual WebSocket transport.

/// The central broadcaster, client registry and relay workers.
pub mod dispatcher;
/// The slow-client eviction policy.
pub mod health;
/// Sample rings for operator metrics.
pub mod metrics;
/// The bounded drop-oldest frame queue.
pub mod relay_queue;

// --- Public API Re-exports ---
pub use self::dispatcher::{ClientTransport, DispatchMode, Dispatcher, DispatcherConfig, Envelope};
pub use self::health::{HealthPolicy, Verdict};
pub use self::relay_queue::{PushOutcome, RelayQueue};

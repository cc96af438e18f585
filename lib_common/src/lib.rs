// Declare the modules to re-export
pub mod core;

// Re-export the primary engine types
pub use crate::core::dispatcher::{
    ClientTransport, DispatchMode, Dispatcher, DispatcherConfig, Envelope, TransportError,
};
pub use crate::core::health::{HealthPolicy, Verdict};
pub use crate::core::relay_queue::{PushOutcome, RelayQueue};

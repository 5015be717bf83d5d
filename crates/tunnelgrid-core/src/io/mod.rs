//! Relay I/O building blocks.

pub mod copy;
pub mod throttle;

pub use copy::{relay_bidirectional, CopyTuning, NoOpMetrics, RelayMetrics};
pub use throttle::Throttle;

//! eventforge: configurable synthetic event generation.
//!
//! Declares *samples* — templates of structured events with typed
//! placeholder tokens — and realizes them into a timed, rated, formatted
//! byte stream delivered to a pluggable sink:
//!
//!   Samples → Timers → generator workers → output workers → sinks
//!
//! The stages are connected by bounded queues; backpressure is the admission
//! control and delivery is lossy by design.

pub mod config;
pub mod output;
pub mod pipeline;
pub mod rater;
pub mod sample;
pub mod script;
pub mod timespec;

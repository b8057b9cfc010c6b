//! Common infrastructure for the Lattice tunnel dispatcher: telemetry and metrics

#![deny(missing_docs)]

pub mod metrics;
pub mod telemetry;

pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryError};

/// Default timeout for opening a logical connection through an agent tunnel
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 15;

/// Default cap on idle pooled connections per host for a tunnel transport
pub const DEFAULT_MAX_IDLE_PER_HOST: usize = 10;

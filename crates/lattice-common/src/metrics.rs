//! OpenTelemetry metrics for tunnel dispatch
//!
//! Instruments are created lazily against the global meter, so they are
//! no-ops until a meter provider is installed by `init_telemetry`.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("lattice-tunnel"));

// ============================================================================
// Resolution Metrics
// ============================================================================

/// Counter of cluster resolutions
///
/// Labels:
/// - `mode`: transport, dialer
/// - `outcome`: reused, built, rebuilt, dialer, not_found, or an error kind
pub static RESOLUTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lattice_tunnel_resolutions_total")
        .with_description("Total number of cluster tunnel resolutions")
        .with_unit("{resolutions}")
        .build()
});

/// Histogram of resolution latency, including store and registry lookups
///
/// Labels:
/// - `mode`: transport, dialer
pub static RESOLVE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("lattice_tunnel_resolve_duration_seconds")
        .with_description("Duration of cluster tunnel resolution in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Transport Cache Metrics
// ============================================================================

/// Counter of transports built into the cache
///
/// Labels:
/// - `reason`: new, address_changed
pub static TRANSPORT_REBUILDS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lattice_tunnel_transport_rebuilds_total")
        .with_description("Total number of tunnel transports constructed")
        .with_unit("{transports}")
        .build()
});

/// Counter of idle pooled connections closed
pub static IDLE_CONNECTIONS_CLOSED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lattice_tunnel_idle_connections_closed_total")
        .with_description("Total number of idle tunnel connections closed")
        .with_unit("{connections}")
        .build()
});

// ============================================================================
// Label Types
// ============================================================================

/// Which resolution path was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Cached, pooled transport
    Transport,
    /// Raw dialer, nothing cached
    Dialer,
}

impl ResolveMode {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Dialer => "dialer",
        }
    }
}

/// Why a transport was constructed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildReason {
    /// No cached transport for the session
    New,
    /// The agent's advertised address changed
    AddressChanged,
}

impl RebuildReason {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::AddressChanged => "address_changed",
        }
    }
}

/// Record a transport construction
pub fn record_rebuild(reason: RebuildReason) {
    TRANSPORT_REBUILDS.add(1, &[KeyValue::new("reason", reason.as_str())]);
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Times one resolution and records its outcome
pub struct ResolveTimer {
    mode: ResolveMode,
    start: std::time::Instant,
}

impl ResolveTimer {
    /// Start timing a resolution
    pub fn start(mode: ResolveMode) -> Self {
        Self {
            mode,
            start: std::time::Instant::now(),
        }
    }

    /// Record completion with an outcome label
    pub fn complete(self, outcome: &'static str) {
        let duration = self.start.elapsed().as_secs_f64();
        let mode = KeyValue::new("mode", self.mode.as_str());

        RESOLVE_DURATION.record(duration, std::slice::from_ref(&mode));
        RESOLUTIONS.add(1, &[mode, KeyValue::new("outcome", outcome)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_values() {
        assert_eq!(ResolveMode::Transport.as_str(), "transport");
        assert_eq!(ResolveMode::Dialer.as_str(), "dialer");
        assert_eq!(RebuildReason::New.as_str(), "new");
        assert_eq!(RebuildReason::AddressChanged.as_str(), "address_changed");
    }

    #[test]
    fn test_recording_without_provider_is_noop() {
        ResolveTimer::start(ResolveMode::Transport).complete("reused");
        record_rebuild(RebuildReason::AddressChanged);
        IDLE_CONNECTIONS_CLOSED.add(3, &[]);
    }
}

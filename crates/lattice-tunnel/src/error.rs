//! Error types for tunnel dispatch
//!
//! Each collaborator (credential store, session registry, transport) has its
//! own error enum. `DispatchError` is what callers of the dispatcher see; it
//! carries the cluster and session context needed to debug routing failures.
//!
//! A cluster without a usable session is not an error: resolution returns
//! `Ok(None)` and only [`DispatchError::NoRoute`] (produced by
//! `TunnelDispatcher::route`) turns it into one for the proxy layer.

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Errors returned by a [`CredentialStore`](crate::credentials::CredentialStore)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialStoreError {
    /// The backing store could not be reached
    #[error("credential store unavailable: {0}")]
    Unavailable(String),

    /// The store returned data that could not be interpreted
    #[error("malformed credential record: {0}")]
    Malformed(String),
}

/// Errors returned by a [`SessionRegistry`](crate::session::SessionRegistry)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// No session is registered for this key (it died or never existed)
    #[error("no tunnel session for key {0}")]
    NotConnected(String),

    /// The registry itself failed while looking up the session
    #[error("session registry error: {0}")]
    Registry(String),
}

/// Errors opening a logical connection through a tunnel session
#[derive(Debug, Error)]
pub enum DialError {
    /// The connection was not established within the dialer's timeout
    #[error("dial to {address} via session {session_key} timed out after {timeout:?}")]
    Timeout {
        /// Session the dial went through
        session_key: String,
        /// Address requested on the far side of the tunnel
        address: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The session rejected or failed the connection
    #[error("dial to {address} via session {session_key} failed: {source}")]
    Io {
        /// Session the dial went through
        session_key: String,
        /// Address requested on the far side of the tunnel
        address: String,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },
}

/// Errors validating dispatcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Dial timeout must be non-zero
    #[error("dial timeout must be greater than zero")]
    ZeroDialTimeout,

    /// Idle pool cap must be non-zero
    #[error("max idle connections per host must be greater than zero")]
    ZeroIdlePool,
}

/// Errors surfaced by the tunnel dispatcher
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The credential store could not be queried, so reachability is unknown
    #[error("credential store unavailable for cluster {cluster}: {source}")]
    StoreUnavailable {
        /// Cluster being resolved
        cluster: String,
        /// Underlying store failure
        #[source]
        source: CredentialStoreError,
    },

    /// A session reported live but no dialer could be obtained for it
    #[error("failed to obtain dialer for cluster {cluster} via session {session_key}: {source}")]
    SessionDial {
        /// Cluster being resolved
        cluster: String,
        /// Session that was reported live
        session_key: String,
        /// Underlying registry failure
        #[source]
        source: SessionError,
    },

    /// No registered endpoint of the cluster has a live session
    #[error("no route to cluster {cluster}")]
    NoRoute {
        /// Cluster being resolved
        cluster: String,
    },
}

impl DispatchError {
    /// HTTP status the proxy layer should answer with
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::SessionDial { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::NoRoute { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Whether retrying the resolution may succeed
    ///
    /// A dial failure means the session died between the liveness check and
    /// the dial; another attempt reshuffles and may land on a different agent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::SessionDial { .. } | DispatchError::StoreUnavailable { .. }
        )
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::StoreUnavailable { .. } => "store_unavailable",
            DispatchError::SessionDial { .. } => "session_dial",
            DispatchError::NoRoute { .. } => "no_route",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_status_codes() {
        assert_eq!(
            DispatchError::NoRoute {
                cluster: "prod".into()
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            DispatchError::StoreUnavailable {
                cluster: "prod".into(),
                source: CredentialStoreError::Unavailable("db down".into()),
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            DispatchError::SessionDial {
                cluster: "prod".into(),
                session_key: "agent-1".into(),
                source: SessionError::NotConnected("agent-1".into()),
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_retryable_errors() {
        let dial = DispatchError::SessionDial {
            cluster: "c".into(),
            session_key: "k".into(),
            source: SessionError::NotConnected("k".into()),
        };
        assert!(dial.is_retryable());

        let no_route = DispatchError::NoRoute {
            cluster: "c".into(),
        };
        assert!(!no_route.is_retryable());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = DispatchError::SessionDial {
            cluster: "edge-7".into(),
            session_key: "agent-a".into(),
            source: SessionError::NotConnected("agent-a".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("edge-7"));
        assert!(msg.contains("agent-a"));
        assert_eq!(err.kind(), "session_dial");
    }
}

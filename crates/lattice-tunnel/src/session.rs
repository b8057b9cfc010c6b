//! Reverse tunnel session tracking
//!
//! Agents hold long-lived outbound sessions to the management plane. The
//! tunnel server registers a `SessionConnector` for each session when the
//! agent's handshake completes and unregisters it when the session drops.
//! Everything above this module sees only liveness and a `Dialer`.
//!
//! # Traits
//!
//! - `SessionConnector`: opens one logical connection through a live session
//! - `SessionRegistry`: liveness + dialer lookup consumed by the dispatcher

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::error::{DialError, SessionError};

/// Byte stream carried over a tunnel session
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

/// A logical connection opened through a tunnel session
pub type TunnelStream = Box<dyn TunnelIo>;

/// Future resolving to a newly opened tunnel stream
pub type DialFuture = BoxFuture<'static, std::io::Result<TunnelStream>>;

/// Opens logical connections through one agent's session
///
/// Implemented by the tunnel server's per-session multiplexer. Closures of
/// the form `Fn(&str) -> DialFuture` implement it too.
pub trait SessionConnector: Send + Sync {
    /// Open a connection to `address` on the agent's side of the tunnel
    fn open(&self, address: &str) -> DialFuture;
}

impl<F> SessionConnector for F
where
    F: Fn(&str) -> DialFuture + Send + Sync,
{
    fn open(&self, address: &str) -> DialFuture {
        (self)(address)
    }
}

/// Dial primitive bound to one session and a fixed timeout
///
/// Cheap to clone; every call to [`Dialer::dial`] opens a new logical
/// connection.
#[derive(Clone)]
pub struct Dialer {
    session_key: String,
    timeout: Duration,
    connector: Arc<dyn SessionConnector>,
}

impl Dialer {
    /// Create a dialer for `session_key`
    pub fn new(
        session_key: impl Into<String>,
        timeout: Duration,
        connector: Arc<dyn SessionConnector>,
    ) -> Self {
        Self {
            session_key: session_key.into(),
            timeout,
            connector,
        }
    }

    /// Session this dialer opens connections through
    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Timeout applied to each dial
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open one logical connection to `address` through the session
    pub async fn dial(&self, address: &str) -> Result<TunnelStream, DialError> {
        match tokio::time::timeout(self.timeout, self.connector.open(address)).await {
            Ok(Ok(stream)) => {
                debug!(session_key = %self.session_key, address = %address, "Opened tunnel connection");
                Ok(stream)
            }
            Ok(Err(source)) => Err(DialError::Io {
                session_key: self.session_key.clone(),
                address: address.to_string(),
                source,
            }),
            Err(_) => Err(DialError::Timeout {
                session_key: self.session_key.clone(),
                address: address.to_string(),
                timeout: self.timeout,
            }),
        }
    }
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("session_key", &self.session_key)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Liveness and dial lookup for tunnel sessions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Whether a live session exists for `session_key`
    async fn has_session(&self, session_key: &str) -> Result<bool, SessionError>;

    /// Dial primitive for `session_key`, applying `timeout` to every dial
    async fn dialer(&self, session_key: &str, timeout: Duration) -> Result<Dialer, SessionError>;
}

type SessionMap = DashMap<String, Arc<dyn SessionConnector>>;

/// In-process session registry
///
/// Thread-safe table of live sessions using DashMap for concurrent access.
/// Unlike agent bookkeeping, a session is removed outright on disconnect:
/// a stale entry here would route traffic into a dead tunnel.
///
/// Dialers handed out by the table look the session up on every dial, so a
/// transport built before an agent reconnected keeps working afterwards.
#[derive(Default)]
pub struct SessionTable {
    sessions: Arc<SessionMap>,
}

impl SessionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live session, replacing any previous one with the same key
    pub fn register(&self, session_key: impl Into<String>, connector: Arc<dyn SessionConnector>) {
        let session_key = session_key.into();
        let is_reconnect = self
            .sessions
            .insert(session_key.clone(), connector)
            .is_some();
        if is_reconnect {
            info!(session_key = %session_key, "Tunnel session replaced");
        } else {
            info!(session_key = %session_key, "Tunnel session registered");
        }
    }

    /// Drop a session; returns false if it was not registered
    ///
    /// Transports a dispatcher cached for this session are not touched; pair
    /// this with `TunnelDispatcher::evict_session` for each cluster the agent
    /// served.
    pub fn unregister(&self, session_key: &str) -> bool {
        let removed = self.sessions.remove(session_key).is_some();
        if removed {
            info!(session_key = %session_key, "Tunnel session closed");
        }
        removed
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Keys of all live sessions
    pub fn session_keys(&self) -> Vec<String> {
        self.sessions.iter().map(|r| r.key().clone()).collect()
    }
}

#[async_trait]
impl SessionRegistry for SessionTable {
    async fn has_session(&self, session_key: &str) -> Result<bool, SessionError> {
        Ok(self.sessions.contains_key(session_key))
    }

    async fn dialer(&self, session_key: &str, timeout: Duration) -> Result<Dialer, SessionError> {
        if !self.sessions.contains_key(session_key) {
            return Err(SessionError::NotConnected(session_key.to_string()));
        }
        let connector = SessionLookup {
            sessions: Arc::clone(&self.sessions),
            session_key: session_key.to_string(),
        };
        Ok(Dialer::new(session_key, timeout, Arc::new(connector)))
    }
}

/// Connector that resolves the current session for a key at dial time
struct SessionLookup {
    sessions: Arc<SessionMap>,
    session_key: String,
}

impl SessionConnector for SessionLookup {
    fn open(&self, address: &str) -> DialFuture {
        let connector = self.sessions.get(&self.session_key).map(|r| Arc::clone(r.value()));
        match connector {
            Some(connector) => connector.open(address),
            None => {
                let session_key = self.session_key.clone();
                Box::pin(async move {
                    Err::<TunnelStream, _>(std::io::Error::new(
                        std::io::ErrorKind::NotConnected,
                        format!("tunnel session {session_key} is gone"),
                    ))
                })
            }
        }
    }
}

/// Registry shared across tasks
pub type SharedSessionRegistry = Arc<dyn SessionRegistry>;

//! Pooled transport over a tunnel session
//!
//! A `TunnelTransport` is the reusable half of a resolution: it wraps the
//! session's `Dialer` and keeps a bounded pool of idle connections per host so
//! consecutive proxied requests do not each open a new logical connection
//! through the tunnel.
//!
//! Connections are checked out with [`TunnelTransport::connect`] and handed
//! back with [`PooledConnection::release`]. A connection dropped without
//! being released is closed, since its protocol state is unknown.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use lattice_common::metrics::IDLE_CONNECTIONS_CLOSED;

use crate::error::DialError;
use crate::session::{Dialer, TunnelStream};

/// Reusable, pooled connection factory bound to one tunnel session
pub struct TunnelTransport {
    dialer: Dialer,
    pool: Arc<IdlePool>,
}

impl TunnelTransport {
    /// Build a transport that keeps at most `max_idle_per_host` idle
    /// connections for each host
    pub fn new(dialer: Dialer, max_idle_per_host: NonZeroUsize) -> Self {
        Self {
            dialer,
            pool: Arc::new(IdlePool::new(max_idle_per_host.get())),
        }
    }

    /// Session this transport dials through
    pub fn session_key(&self) -> &str {
        self.dialer.session_key()
    }

    /// Per-host idle connection cap
    pub fn max_idle_per_host(&self) -> usize {
        self.pool.max_idle_per_host
    }

    /// Get a connection to `host`, reusing an idle one when available
    pub async fn connect(&self, host: &str) -> Result<PooledConnection, DialError> {
        if let Some(stream) = self.pool.checkout(host) {
            debug!(session_key = %self.session_key(), host = %host, "Reusing idle tunnel connection");
            return Ok(PooledConnection::new(stream, host, &self.pool, true));
        }

        let stream = self.dialer.dial(host).await?;
        Ok(PooledConnection::new(stream, host, &self.pool, false))
    }

    /// Close every idle connection; connections in use are left alone
    ///
    /// Returns the number of connections closed.
    pub fn close_idle_connections(&self) -> usize {
        let closed = self.pool.drain();
        if closed > 0 {
            IDLE_CONNECTIONS_CLOSED.add(closed as u64, &[]);
            debug!(session_key = %self.session_key(), closed, "Closed idle tunnel connections");
        }
        closed
    }

    /// Stop pooling and close idle connections
    ///
    /// The transport still dials for holders of the handle, and in-flight
    /// connections keep working. Released connections are closed instead of
    /// returning to the pool.
    pub fn retire(&self) -> usize {
        self.pool.retire();
        self.close_idle_connections()
    }

    /// Whether [`retire`](Self::retire) has been called
    pub fn is_retired(&self) -> bool {
        self.pool.state.lock().retired
    }

    /// Total idle connections across all hosts
    pub fn idle_connections(&self) -> usize {
        self.pool.state.lock().idle.values().map(Vec::len).sum()
    }

    /// Idle connections pooled for `host`
    pub fn idle_connections_for(&self, host: &str) -> usize {
        self.pool
            .state
            .lock()
            .idle
            .get(host)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl fmt::Debug for TunnelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelTransport")
            .field("session_key", &self.session_key())
            .field("max_idle_per_host", &self.pool.max_idle_per_host)
            .field("idle", &self.idle_connections())
            .finish()
    }
}

struct IdlePool {
    max_idle_per_host: usize,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    idle: HashMap<String, Vec<TunnelStream>>,
    retired: bool,
}

impl IdlePool {
    fn new(max_idle_per_host: usize) -> Self {
        Self {
            max_idle_per_host,
            state: Mutex::new(PoolState::default()),
        }
    }

    fn checkout(&self, host: &str) -> Option<TunnelStream> {
        self.state.lock().idle.get_mut(host).and_then(Vec::pop)
    }

    /// Returns false if the stream was closed instead of pooled
    fn checkin(&self, host: &str, stream: TunnelStream) -> bool {
        let mut state = self.state.lock();
        if state.retired {
            return false;
        }
        let idle = state.idle.entry(host.to_string()).or_default();
        if idle.len() >= self.max_idle_per_host {
            return false;
        }
        idle.push(stream);
        true
    }

    fn drain(&self) -> usize {
        let drained: Vec<TunnelStream> = {
            let mut state = self.state.lock();
            state.idle.drain().flat_map(|(_, streams)| streams).collect()
        };
        drained.len()
    }

    fn retire(&self) {
        self.state.lock().retired = true;
    }
}

/// A connection checked out of a [`TunnelTransport`]
pub struct PooledConnection {
    stream: Option<TunnelStream>,
    host: String,
    pool: Arc<IdlePool>,
    reused: bool,
}

impl PooledConnection {
    fn new(stream: TunnelStream, host: &str, pool: &Arc<IdlePool>, reused: bool) -> Self {
        Self {
            stream: Some(stream),
            host: host.to_string(),
            pool: Arc::clone(pool),
            reused,
        }
    }

    /// Host this connection was opened to
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether the connection came from the idle pool
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Return the connection to the idle pool
    ///
    /// Only call this once the exchange on the connection is complete. Returns
    /// false if the connection was closed because the pool is full or the
    /// transport was retired.
    pub fn release(mut self) -> bool {
        match self.stream.take() {
            Some(stream) => self.pool.checkin(&self.host, stream),
            None => false,
        }
    }

    fn stream_mut(&mut self) -> io::Result<&mut TunnelStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection released"))
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("host", &self.host)
            .field("reused", &self.reused)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for PooledConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for PooledConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

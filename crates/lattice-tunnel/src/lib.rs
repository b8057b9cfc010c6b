//! Lattice Tunnel - routing management-plane traffic over agent reverse tunnels
//!
//! Child cluster agents dial out to the cell and hold a session open; the cell
//! reaches the cluster back through that session. This crate provides:
//!
//! - **Credential Store**: which agent sessions can reach which cluster
//! - **Session Registry**: liveness and dialers for agent sessions
//! - **Tunnel Transport**: pooled connections over one session
//! - **Tunnel Dispatcher**: picks a live session for a cluster and caches its transport

#![deny(missing_docs)]

pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod session;
pub mod transport;

pub use config::{DispatcherConfig, TunnelArgs};
pub use credentials::{
    CredentialStore, InMemoryCredentialStore, SharedCredentialStore, TunnelCredential,
};
pub use dispatcher::{
    CacheStats, ResolvedDialer, ResolvedTransport, SharedTunnelDispatcher, TunnelDispatcher,
};
pub use error::{ConfigError, CredentialStoreError, DialError, DispatchError, SessionError};
pub use session::{
    DialFuture, Dialer, SessionConnector, SessionRegistry, SessionTable, SharedSessionRegistry,
    TunnelIo, TunnelStream,
};
pub use transport::{PooledConnection, TunnelTransport};

//! Tunnel transport dispatcher
//!
//! Turns a cluster id into something that can carry traffic to that cluster:
//!
//! 1. Fetch the cluster's credentials and shuffle them, spreading load across
//!    HA agents without favoring the first one registered.
//! 2. Walk the shuffled list and take the first credential whose session is
//!    live in the session registry.
//! 3. Either return a cached pooled transport for that `(cluster, session)`
//!    pair, rebuilding it when the agent's advertised address changed
//!    ([`TunnelDispatcher::resolve`]), or return a raw dialer without touching
//!    the cache ([`TunnelDispatcher::resolve_dialer`]).
//!
//! The whole check-decide-mutate sequence on the cache runs under one lock
//! covering every cluster, so concurrent resolutions of the same pair never
//! build two transports.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use lattice_common::metrics::{record_rebuild, RebuildReason, ResolveMode, ResolveTimer};

use crate::config::DispatcherConfig;
use crate::credentials::{SharedCredentialStore, TunnelCredential};
use crate::error::{ConfigError, DispatchError};
use crate::session::{Dialer, SharedSessionRegistry};
use crate::transport::TunnelTransport;

/// A transport ready to carry traffic to a cluster
#[derive(Clone, Debug)]
pub struct ResolvedTransport {
    /// Address the selected agent advertises
    pub server_address: String,
    /// Shared transport; the same instance is returned while the address holds
    pub transport: Arc<TunnelTransport>,
}

/// A raw dialer for one logical connection to a cluster
#[derive(Clone, Debug)]
pub struct ResolvedDialer {
    /// Address the selected agent advertises
    pub server_address: String,
    /// Dialer bound to the selected agent's session
    pub dialer: Dialer,
}

/// Snapshot of the transport cache size
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Clusters with at least one cached transport
    pub clusters: usize,
    /// Cached transports across all clusters
    pub transports: usize,
}

/// Cached transport plus the address it was built for
struct CachedTransport {
    transport: Arc<TunnelTransport>,
    server_address: String,
}

/// cluster id -> session key -> cached transport
type TransportCache = HashMap<String, HashMap<String, CachedTransport>>;

#[derive(Clone, Copy, Debug)]
enum CacheOutcome {
    Reused,
    Rebuilt(RebuildReason),
}

impl CacheOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Reused => "reused",
            Self::Rebuilt(RebuildReason::New) => "built",
            Self::Rebuilt(RebuildReason::AddressChanged) => "rebuilt",
        }
    }
}

/// Routes cluster traffic onto agent reverse tunnels
///
/// Construct once per process and share via [`SharedTunnelDispatcher`];
/// all methods take `&self` and are safe to call concurrently.
pub struct TunnelDispatcher {
    credentials: SharedCredentialStore,
    sessions: SharedSessionRegistry,
    config: DispatcherConfig,
    max_idle_per_host: NonZeroUsize,
    cache: Mutex<TransportCache>,
}

impl TunnelDispatcher {
    /// Create a dispatcher with an empty transport cache
    pub fn new(
        credentials: SharedCredentialStore,
        sessions: SharedSessionRegistry,
        config: DispatcherConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let max_idle_per_host =
            NonZeroUsize::new(config.max_idle_per_host).ok_or(ConfigError::ZeroIdlePool)?;
        Ok(Self {
            credentials,
            sessions,
            config,
            max_idle_per_host,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Settings applied to built transports
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Resolve a pooled transport to `cluster_id`
    ///
    /// Returns `Ok(None)` when the cluster has no credentials or none of its
    /// sessions is live.
    #[instrument(skip(self), fields(cluster = %cluster_id))]
    pub async fn resolve(
        &self,
        cluster_id: &str,
    ) -> Result<Option<ResolvedTransport>, DispatchError> {
        let timer = ResolveTimer::start(ResolveMode::Transport);
        match self.resolve_transport(cluster_id).await {
            Ok(Some((resolved, outcome))) => {
                timer.complete(outcome.as_str());
                Ok(Some(resolved))
            }
            Ok(None) => {
                timer.complete("not_found");
                Ok(None)
            }
            Err(e) => {
                timer.complete(e.kind());
                Err(e)
            }
        }
    }

    /// Resolve a raw dialer to `cluster_id` without touching the cache
    #[instrument(skip(self), fields(cluster = %cluster_id))]
    pub async fn resolve_dialer(
        &self,
        cluster_id: &str,
    ) -> Result<Option<ResolvedDialer>, DispatchError> {
        let timer = ResolveTimer::start(ResolveMode::Dialer);
        let result = self.resolve_raw_dialer(cluster_id).await;
        timer.complete(match &result {
            Ok(Some(_)) => "dialer",
            Ok(None) => "not_found",
            Err(e) => e.kind(),
        });
        result
    }

    /// Like [`resolve`](Self::resolve), but a missing route is an error
    ///
    /// For the proxy layer, which answers [`DispatchError::NoRoute`] with
    /// 502 Bad Gateway.
    pub async fn route(&self, cluster_id: &str) -> Result<ResolvedTransport, DispatchError> {
        self.resolve(cluster_id)
            .await?
            .ok_or_else(|| DispatchError::NoRoute {
                cluster: cluster_id.to_string(),
            })
    }

    /// Drop the cached transport for one session of a cluster
    ///
    /// The cache does not watch the session registry, so hosts should call
    /// this when an agent session disconnects. Otherwise the dead session's
    /// transport and its idle connections stay cached until the cluster is
    /// evicted.
    ///
    /// The evicted transport is retired: idle connections close, in-flight
    /// ones finish normally.
    pub async fn evict_session(&self, cluster_id: &str, session_key: &str) -> bool {
        let mut cache = self.cache.lock().await;
        let Some(sessions) = cache.get_mut(cluster_id) else {
            return false;
        };
        let removed = sessions.remove(session_key);
        if sessions.is_empty() {
            cache.remove(cluster_id);
        }
        drop(cache);

        match removed {
            Some(entry) => {
                let closed = entry.transport.retire();
                info!(
                    cluster = %cluster_id,
                    session_key = %session_key,
                    idle_closed = closed,
                    "Evicted tunnel transport"
                );
                true
            }
            None => false,
        }
    }

    /// Drop every cached transport of a cluster, returning how many
    pub async fn evict_cluster(&self, cluster_id: &str) -> usize {
        let removed = self.cache.lock().await.remove(cluster_id);
        let Some(sessions) = removed else {
            return 0;
        };
        for entry in sessions.values() {
            entry.transport.retire();
        }
        info!(cluster = %cluster_id, transports = sessions.len(), "Evicted cluster tunnel transports");
        sessions.len()
    }

    /// Current transport cache size
    pub async fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.lock().await;
        CacheStats {
            clusters: cache.len(),
            transports: cache.values().map(HashMap::len).sum(),
        }
    }

    /// Cached transport for a `(cluster, session)` pair, if any
    pub async fn cached_transport(
        &self,
        cluster_id: &str,
        session_key: &str,
    ) -> Option<Arc<TunnelTransport>> {
        self.cache
            .lock()
            .await
            .get(cluster_id)
            .and_then(|sessions| sessions.get(session_key))
            .map(|entry| Arc::clone(&entry.transport))
    }

    // =========================================================================
    // Candidate selection
    // =========================================================================

    /// All credentials of the cluster in a fresh random order
    async fn select_candidates(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<TunnelCredential>, DispatchError> {
        let mut candidates = self
            .credentials
            .credentials_for_cluster(cluster_id)
            .await
            .map_err(|source| {
                warn!(cluster = %cluster_id, error = %source, "Credential store query failed");
                DispatchError::StoreUnavailable {
                    cluster: cluster_id.to_string(),
                    source,
                }
            })?;
        candidates.shuffle(&mut rand::thread_rng());
        Ok(candidates)
    }

    /// First candidate, in shuffled order, whose session is live
    async fn find_live_session(
        &self,
        cluster_id: &str,
    ) -> Result<Option<TunnelCredential>, DispatchError> {
        let candidates = self.select_candidates(cluster_id).await?;
        if candidates.is_empty() {
            debug!(cluster = %cluster_id, "No tunnel credentials registered");
            return Ok(None);
        }

        let total = candidates.len();
        for credential in candidates {
            match self.sessions.has_session(&credential.session_key).await {
                Ok(true) => {
                    debug!(
                        cluster = %cluster_id,
                        session_key = %credential.session_key,
                        "Found live tunnel session"
                    );
                    return Ok(Some(credential));
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        cluster = %cluster_id,
                        session_key = %credential.session_key,
                        error = %e,
                        "Session liveness check failed, trying next candidate"
                    );
                }
            }
        }

        warn!(cluster = %cluster_id, candidates = total, "No live tunnel session for cluster");
        Ok(None)
    }

    // =========================================================================
    // Resolution paths
    // =========================================================================

    async fn resolve_transport(
        &self,
        cluster_id: &str,
    ) -> Result<Option<(ResolvedTransport, CacheOutcome)>, DispatchError> {
        let Some(credential) = self.find_live_session(cluster_id).await? else {
            return Ok(None);
        };
        let TunnelCredential {
            session_key,
            server_address,
            ..
        } = credential;

        // Held until the cache reflects the decision; see module docs
        let mut cache = self.cache.lock().await;

        let reason = match cache
            .get(cluster_id)
            .and_then(|sessions| sessions.get(&session_key))
        {
            Some(entry) if entry.server_address == server_address => {
                debug!(cluster = %cluster_id, session_key = %session_key, "Reusing tunnel transport");
                let transport = Arc::clone(&entry.transport);
                return Ok(Some((
                    ResolvedTransport {
                        server_address,
                        transport,
                    },
                    CacheOutcome::Reused,
                )));
            }
            Some(entry) => {
                info!(
                    cluster = %cluster_id,
                    session_key = %session_key,
                    old_address = %entry.server_address,
                    new_address = %server_address,
                    "Server address changed, rebuilding tunnel transport"
                );
                RebuildReason::AddressChanged
            }
            None => RebuildReason::New,
        };

        let dialer = self
            .sessions
            .dialer(&session_key, self.config.dial_timeout)
            .await
            .map_err(|source| {
                warn!(
                    cluster = %cluster_id,
                    session_key = %session_key,
                    error = %source,
                    "Session went away before dialer could be obtained"
                );
                DispatchError::SessionDial {
                    cluster: cluster_id.to_string(),
                    session_key: session_key.clone(),
                    source,
                }
            })?;

        let transport = Arc::new(TunnelTransport::new(dialer, self.max_idle_per_host));

        let previous = cache.entry(cluster_id.to_string()).or_default().insert(
            session_key.clone(),
            CachedTransport {
                transport: Arc::clone(&transport),
                server_address: server_address.clone(),
            },
        );
        // Holders of the old handle can still dial through it
        if let Some(previous) = previous {
            let closed = previous.transport.retire();
            debug!(
                cluster = %cluster_id,
                session_key = %session_key,
                idle_closed = closed,
                "Retired previous tunnel transport"
            );
        }
        drop(cache);

        record_rebuild(reason);
        info!(
            cluster = %cluster_id,
            session_key = %session_key,
            address = %server_address,
            reason = reason.as_str(),
            "Built tunnel transport"
        );

        Ok(Some((
            ResolvedTransport {
                server_address,
                transport,
            },
            CacheOutcome::Rebuilt(reason),
        )))
    }

    async fn resolve_raw_dialer(
        &self,
        cluster_id: &str,
    ) -> Result<Option<ResolvedDialer>, DispatchError> {
        let Some(credential) = self.find_live_session(cluster_id).await? else {
            return Ok(None);
        };

        let dialer = self
            .sessions
            .dialer(&credential.session_key, self.config.dial_timeout)
            .await
            .map_err(|source| {
                warn!(
                    cluster = %cluster_id,
                    session_key = %credential.session_key,
                    error = %source,
                    "Session went away before dialer could be obtained"
                );
                DispatchError::SessionDial {
                    cluster: cluster_id.to_string(),
                    session_key: credential.session_key.clone(),
                    source,
                }
            })?;

        Ok(Some(ResolvedDialer {
            server_address: credential.server_address,
            dialer,
        }))
    }
}

/// Dispatcher shared across request handlers
pub type SharedTunnelDispatcher = Arc<TunnelDispatcher>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::credentials::{InMemoryCredentialStore, MockCredentialStore};
    use crate::error::{CredentialStoreError, SessionError};
    use crate::session::{
        DialFuture, MockSessionRegistry, SessionConnector, SessionTable, TunnelStream,
    };

    fn null_connector() -> Arc<dyn SessionConnector> {
        Arc::new(|_: &str| -> DialFuture {
            Box::pin(async {
                let (client, _server) = tokio::io::duplex(16);
                Ok::<TunnelStream, std::io::Error>(Box::new(client))
            })
        })
    }

    fn dispatcher(
        store: Arc<InMemoryCredentialStore>,
        sessions: Arc<SessionTable>,
    ) -> TunnelDispatcher {
        TunnelDispatcher::new(store, sessions, DispatcherConfig::default()).unwrap()
    }

    fn live_dialer(session_key: &str) -> Dialer {
        Dialer::new(session_key, Duration::from_secs(15), null_connector())
    }

    #[tokio::test]
    async fn test_unknown_cluster_not_found() {
        let d = dispatcher(
            Arc::new(InMemoryCredentialStore::new()),
            Arc::new(SessionTable::new()),
        );
        assert!(d.resolve("nowhere").await.unwrap().is_none());
        assert!(d.resolve_dialer("nowhere").await.unwrap().is_none());
        assert_eq!(d.cache_stats().await, CacheStats::default());
    }

    #[tokio::test]
    async fn test_no_live_session_not_found() {
        let store = Arc::new(InMemoryCredentialStore::new());
        store.register(TunnelCredential::new("prod", "agent-a", "a:6443"));
        store.register(TunnelCredential::new("prod", "agent-b", "b:6443"));
        let d = dispatcher(store, Arc::new(SessionTable::new()));

        assert!(d.resolve("prod").await.unwrap().is_none());
        assert!(d.resolve_dialer("prod").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_reuses_transport() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let sessions = Arc::new(SessionTable::new());
        store.register(TunnelCredential::new("prod", "agent-a", "a:6443"));
        sessions.register("agent-a", null_connector());
        let d = dispatcher(store, sessions);

        let first = d.resolve("prod").await.unwrap().unwrap();
        let second = d.resolve("prod").await.unwrap().unwrap();

        assert_eq!(first.server_address, "a:6443");
        assert!(Arc::ptr_eq(&first.transport, &second.transport));
        assert_eq!(first.transport.max_idle_per_host(), 10);
        assert_eq!(
            d.cache_stats().await,
            CacheStats {
                clusters: 1,
                transports: 1
            }
        );
    }

    #[tokio::test]
    async fn test_address_change_rebuilds_and_retires_old() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let sessions = Arc::new(SessionTable::new());
        store.register(TunnelCredential::new("prod", "agent-a", "lb-1:6443"));
        sessions.register("agent-a", null_connector());
        let d = dispatcher(store.clone(), sessions);

        let first = d.resolve("prod").await.unwrap().unwrap();
        first.transport.connect("api:443").await.unwrap().release();
        assert_eq!(first.transport.idle_connections(), 1);

        store.register(TunnelCredential::new("prod", "agent-a", "lb-2:6443"));
        let second = d.resolve("prod").await.unwrap().unwrap();

        assert_eq!(second.server_address, "lb-2:6443");
        assert!(!Arc::ptr_eq(&first.transport, &second.transport));
        assert!(first.transport.is_retired());
        assert_eq!(first.transport.idle_connections(), 0);
        assert_eq!(d.cache_stats().await.transports, 1);
    }

    #[tokio::test]
    async fn test_handle_held_across_rebuild_still_connects() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let sessions = Arc::new(SessionTable::new());
        store.register(TunnelCredential::new("prod", "agent-a", "lb-1:6443"));
        sessions.register("agent-a", null_connector());
        let d = dispatcher(store.clone(), sessions);

        let held = d.resolve("prod").await.unwrap().unwrap();
        store.register(TunnelCredential::new("prod", "agent-a", "lb-2:6443"));
        let rebuilt = d.resolve("prod").await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&held.transport, &rebuilt.transport));

        // A request that picked up the old handle before the rebuild proceeds
        let conn = held.transport.connect("api:443").await.unwrap();
        assert!(!conn.is_reused());
        assert!(!conn.release());
        assert_eq!(held.transport.idle_connections(), 0);
    }

    #[tokio::test]
    async fn test_resolve_dialer_leaves_cache_alone() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let sessions = Arc::new(SessionTable::new());
        store.register(TunnelCredential::new("prod", "agent-a", "a:6443"));
        sessions.register("agent-a", null_connector());
        let d = dispatcher(store, sessions);

        let resolved = d.resolve_dialer("prod").await.unwrap().unwrap();
        assert_eq!(resolved.server_address, "a:6443");
        assert_eq!(resolved.dialer.session_key(), "agent-a");
        assert_eq!(resolved.dialer.timeout(), Duration::from_secs(15));
        assert_eq!(d.cache_stats().await, CacheStats::default());

        d.resolve("prod").await.unwrap().unwrap();
        d.resolve_dialer("prod").await.unwrap().unwrap();
        assert_eq!(d.cache_stats().await.transports, 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_distinct_error() {
        let mut store = MockCredentialStore::new();
        store
            .expect_credentials_for_cluster()
            .returning(|_| Err(CredentialStoreError::Unavailable("connection refused".into())));
        let d = TunnelDispatcher::new(
            Arc::new(store),
            Arc::new(SessionTable::new()),
            DispatcherConfig::default(),
        )
        .unwrap();

        let err = d.resolve("prod").await.unwrap_err();
        assert!(
            matches!(err, DispatchError::StoreUnavailable { ref cluster, .. } if cluster == "prod")
        );

        let err = d.resolve_dialer("prod").await.unwrap_err();
        assert!(matches!(err, DispatchError::StoreUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_liveness_error_skips_candidate() {
        let store = Arc::new(InMemoryCredentialStore::new());
        store.register(TunnelCredential::new("prod", "agent-broken", "x:6443"));
        store.register(TunnelCredential::new("prod", "agent-ok", "y:6443"));

        let mut sessions = MockSessionRegistry::new();
        sessions.expect_has_session().returning(|key| match key {
            "agent-broken" => Err(SessionError::Registry("lookup failed".into())),
            _ => Ok(true),
        });
        sessions
            .expect_dialer()
            .returning(|key, _| Ok(live_dialer(key)));
        let d = TunnelDispatcher::new(store, Arc::new(sessions), DispatcherConfig::default())
            .unwrap();

        for _ in 0..20 {
            let resolved = d.resolve("prod").await.unwrap().unwrap();
            assert_eq!(resolved.server_address, "y:6443");
        }
    }

    #[tokio::test]
    async fn test_dial_failure_surfaces_and_caches_nothing() {
        let store = Arc::new(InMemoryCredentialStore::new());
        store.register(TunnelCredential::new("prod", "agent-a", "a:6443"));

        let mut sessions = MockSessionRegistry::new();
        sessions.expect_has_session().returning(|_| Ok(true));
        sessions
            .expect_dialer()
            .returning(|key, _| Err(SessionError::NotConnected(key.to_string())));
        let d = TunnelDispatcher::new(store, Arc::new(sessions), DispatcherConfig::default())
            .unwrap();

        let err = d.resolve("prod").await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::SessionDial { ref session_key, .. } if session_key == "agent-a"
        ));
        assert!(err.is_retryable());
        assert_eq!(d.cache_stats().await, CacheStats::default());

        let err = d.resolve_dialer("prod").await.unwrap_err();
        assert!(matches!(err, DispatchError::SessionDial { .. }));
    }

    #[tokio::test]
    async fn test_dial_failure_keeps_previous_entry() {
        let store = Arc::new(InMemoryCredentialStore::new());
        store.register(TunnelCredential::new("prod", "agent-a", "lb-1:6443"));

        // First dial succeeds, the session is gone for every later one
        let dials = AtomicUsize::new(0);
        let mut sessions = MockSessionRegistry::new();
        sessions.expect_has_session().returning(|_| Ok(true));
        sessions.expect_dialer().returning(move |key, _| {
            if dials.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(live_dialer(key))
            } else {
                Err(SessionError::NotConnected(key.to_string()))
            }
        });
        let d =
            TunnelDispatcher::new(store.clone(), Arc::new(sessions), DispatcherConfig::default())
                .unwrap();

        let first = d.resolve("prod").await.unwrap().unwrap();
        store.register(TunnelCredential::new("prod", "agent-a", "lb-2:6443"));
        assert!(d.resolve("prod").await.is_err());

        let cached = d.cached_transport("prod", "agent-a").await.unwrap();
        assert!(Arc::ptr_eq(&first.transport, &cached));
        assert!(!cached.is_retired());
    }

    #[tokio::test]
    async fn test_route_maps_missing_to_no_route() {
        let d = dispatcher(
            Arc::new(InMemoryCredentialStore::new()),
            Arc::new(SessionTable::new()),
        );
        let err = d.route("ghost").await.unwrap_err();
        assert!(matches!(err, DispatchError::NoRoute { ref cluster } if cluster == "ghost"));
        assert_eq!(err.status_code(), http::StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_evict_session_and_cluster() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let sessions = Arc::new(SessionTable::new());
        store.register(TunnelCredential::new("prod", "agent-a", "a:6443"));
        store.register(TunnelCredential::new("dev", "agent-d", "d:6443"));
        sessions.register("agent-a", null_connector());
        sessions.register("agent-d", null_connector());
        let d = dispatcher(store, sessions);

        let prod = d.resolve("prod").await.unwrap().unwrap();
        let dev = d.resolve("dev").await.unwrap().unwrap();
        assert_eq!(d.cache_stats().await.clusters, 2);

        assert!(d.evict_session("prod", "agent-a").await);
        assert!(!d.evict_session("prod", "agent-a").await);
        assert!(prod.transport.is_retired());
        assert_eq!(d.cache_stats().await.clusters, 1);

        assert_eq!(d.evict_cluster("dev").await, 1);
        assert_eq!(d.evict_cluster("dev").await, 0);
        assert!(dev.transport.is_retired());
        assert_eq!(d.cache_stats().await, CacheStats::default());

        // Next resolution builds a fresh transport
        let again = d.resolve("prod").await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&prod.transport, &again.transport));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = TunnelDispatcher::new(
            Arc::new(InMemoryCredentialStore::new()),
            Arc::new(SessionTable::new()),
            DispatcherConfig {
                max_idle_per_host: 0,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(ConfigError::ZeroIdlePool)));
    }
}

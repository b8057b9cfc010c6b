//! Tunnel credentials: which agent sessions can reach which cluster
//!
//! Agents register a credential when they establish their reverse tunnel. A
//! cluster may have several (HA agents); each names the session key to ask the
//! session registry about and the server address the agent advertises.
//!
//! # Traits
//!
//! - `CredentialStore`: read side consumed by the dispatcher

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::CredentialStoreError;

/// One registered path to a cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TunnelCredential {
    /// Logical backend cluster this credential reaches
    pub cluster_id: String,
    /// Key of the agent's session in the session registry
    pub session_key: String,
    /// Address the agent currently advertises; may change on re-registration
    pub server_address: String,
}

impl TunnelCredential {
    /// Create a new credential
    pub fn new(
        cluster_id: impl Into<String>,
        session_key: impl Into<String>,
        server_address: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            session_key: session_key.into(),
            server_address: server_address.into(),
        }
    }
}

/// Source of truth for which endpoints serve a cluster
///
/// The dispatcher only reads from the store. Implementations must be safe for
/// concurrent use; the order of returned credentials carries no meaning.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// All credentials currently registered for `cluster_id` (possibly empty)
    async fn credentials_for_cluster(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<TunnelCredential>, CredentialStoreError>;
}

/// In-process credential store
///
/// Keyed by cluster; within a cluster a credential is unique per session key,
/// so re-registering a session with a new address replaces the old record.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    credentials: DashMap<String, Vec<TunnelCredential>>,
}

impl InMemoryCredentialStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a credential
    ///
    /// Returns the previous server address if the session was already
    /// registered for this cluster.
    pub fn register(&self, credential: TunnelCredential) -> Option<String> {
        let mut entry = self
            .credentials
            .entry(credential.cluster_id.clone())
            .or_default();

        if let Some(existing) = entry
            .iter_mut()
            .find(|c| c.session_key == credential.session_key)
        {
            let previous = std::mem::replace(
                &mut existing.server_address,
                credential.server_address.clone(),
            );
            if previous != credential.server_address {
                info!(
                    cluster = %credential.cluster_id,
                    session_key = %credential.session_key,
                    old_address = %previous,
                    new_address = %credential.server_address,
                    "Tunnel credential address changed"
                );
            }
            return Some(previous);
        }

        debug!(
            cluster = %credential.cluster_id,
            session_key = %credential.session_key,
            address = %credential.server_address,
            "Registered tunnel credential"
        );
        entry.push(credential);
        None
    }

    /// Remove the credential for one session of a cluster
    pub fn deregister(&self, cluster_id: &str, session_key: &str) -> bool {
        let removed = match self.credentials.get_mut(cluster_id) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|c| c.session_key != session_key);
                before != entry.len()
            }
            None => false,
        };
        self.credentials.remove_if(cluster_id, |_, v| v.is_empty());
        if removed {
            info!(cluster = %cluster_id, session_key = %session_key, "Deregistered tunnel credential");
        }
        removed
    }

    /// Remove every credential of a cluster, returning how many were removed
    pub fn deregister_cluster(&self, cluster_id: &str) -> usize {
        self.credentials
            .remove(cluster_id)
            .map(|(_, v)| v.len())
            .unwrap_or(0)
    }

    /// Number of clusters with at least one credential
    pub fn cluster_count(&self) -> usize {
        self.credentials.len()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn credentials_for_cluster(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<TunnelCredential>, CredentialStoreError> {
        Ok(self
            .credentials
            .get(cluster_id)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }
}

/// Store shared across tasks
pub type SharedCredentialStore = Arc<dyn CredentialStore>;

// ============================================================================
// memsession Library
// ============================================================================

pub mod core;
pub mod codec;
pub mod operations;
pub mod store;
pub mod connection;
pub mod client;
pub mod session;

// Re-export main types for convenience
pub use core::{AttributeValue, OwnerId, Result, SessionError, SessionId};
pub use codec::{JsonCodec, MessagePackCodec, ValueCodec};
pub use operations::{SessionOperation, SessionState};
pub use store::{
    DistributedMap, InMemoryCluster, InMemoryConnector, InMemoryDistributedMap, StoreConnector,
    StoreHandle,
};

// Re-export connection API
pub use connection::{
    ConnectionSupervisor, OrphanQueue, OrphanedDeletion, StoreConfig, SupervisorStats,
};
pub use client::SessionReplicationClient;
pub use session::{ClusteredSession, LocalCacheEntry, SessionConfig, SessionManager};

use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// High-level Node API
// ============================================================================

/// One process taking part in session replication.
///
/// Wires the [`ConnectionSupervisor`], the [`SessionReplicationClient`] and a
/// [`SessionManager`] together and starts the background reconnect probe.
///
/// # Examples
///
/// ```
/// use memsession::{InMemoryCluster, OwnerId, SessionConfig, SessionNode, StoreConfig};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> memsession::Result<()> {
/// let cluster = InMemoryCluster::new();
/// let node = SessionNode::start(
///     OwnerId::generate(),
///     StoreConfig::new("web-sessions"),
///     SessionConfig::deferred(),
///     Arc::new(cluster.connector()),
/// )
/// .await?;
///
/// let session = node.manager().attach("abc", true).await?;
/// session.set_attribute("user", serde_json::json!("ada")).await?;
/// node.manager().complete_request(&session).await;
///
/// node.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionNode {
    manager: SessionManager,
}

impl SessionNode {
    /// Builds the node and makes a first connection attempt. An unreachable
    /// store is not an error here; the probe keeps retrying.
    pub async fn start(
        owner: OwnerId,
        store: StoreConfig,
        session: SessionConfig,
        connector: Arc<dyn StoreConnector>,
    ) -> Result<Self> {
        let supervisor = ConnectionSupervisor::new(store, connector)?;
        supervisor.start().await?;
        let client = SessionReplicationClient::with_default_codec(owner, supervisor);
        Ok(Self {
            manager: SessionManager::new(Arc::new(client), session),
        })
    }

    /// Builds the node from deployment parameters (`map-name`, `session-ttl`,
    /// `transient-attributes`, `deferred-write`).
    pub async fn from_params(
        owner: OwnerId,
        params: &HashMap<String, String>,
        connector: Arc<dyn StoreConnector>,
    ) -> Result<Self> {
        let store = StoreConfig::from_params(params)?;
        let session = SessionConfig::from_params(params)?;
        Self::start(owner, store, session, connector).await
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn client(&self) -> &Arc<SessionReplicationClient> {
        self.manager.client()
    }

    pub fn stats(&self) -> Result<SupervisorStats> {
        self.client().supervisor().stats()
    }

    /// Releases live sessions and stops the reconnect probe.
    pub async fn shutdown(&self) -> Result<()> {
        self.manager.shutdown().await
    }
}

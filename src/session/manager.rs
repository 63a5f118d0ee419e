use super::clustered::ClusteredSession;
use super::config::SessionConfig;
use crate::client::SessionReplicationClient;
use crate::core::{Result, SessionId};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{Level, event};

/// Request-scoped entry point for one process.
///
/// Keeps the live [`ClusteredSession`] handles of this process, flushes them
/// when a request completes and releases ownership when a handle is dropped.
pub struct SessionManager {
    client: Arc<SessionReplicationClient>,
    config: Arc<SessionConfig>,
    sessions: RwLock<HashMap<SessionId, Arc<ClusteredSession>>>,
}

impl SessionManager {
    pub fn new(client: Arc<SessionReplicationClient>, config: SessionConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<SessionReplicationClient> {
        &self.client
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns the live handle for `id`, attaching to the cluster session
    /// first if this process does not hold one yet. `cluster_wide_new` marks
    /// a session that was just created and does not exist in the store.
    pub async fn attach(&self, id: &str, cluster_wide_new: bool) -> Result<Arc<ClusteredSession>> {
        if let Some(session) = self.get(id)? {
            return Ok(session);
        }

        let session = Arc::new(
            ClusteredSession::attach(
                id,
                Arc::clone(&self.client),
                Arc::clone(&self.config),
                cluster_wide_new,
            )
            .await?,
        );

        let mut sessions = self.sessions.write()?;
        match sessions.get(id) {
            // Another request attached concurrently; keep its handle.
            Some(existing) if existing.is_valid() => Ok(Arc::clone(existing)),
            _ => {
                sessions.insert(id.to_string(), Arc::clone(&session));
                Ok(session)
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Arc<ClusteredSession>>> {
        let sessions = self.sessions.read()?;
        Ok(sessions.get(id).filter(|session| session.is_valid()).cloned())
    }

    /// Ends a unit of work on `session`: pending changes are flushed.
    ///
    /// A failed flush is logged and leaves the changes dirty for the next
    /// request. Returns true when the session is in sync with the store.
    pub async fn complete_request(&self, session: &ClusteredSession) -> bool {
        match session.needs_flush() {
            Ok(false) => return true,
            Ok(true) => {}
            Err(err) => {
                event!(Level::WARN, session_id = session.id(), error = %err, "cannot inspect session");
                return false;
            }
        }
        match session.flush().await {
            Ok(_) => true,
            Err(err) => {
                event!(
                    Level::WARN,
                    session_id = session.id(),
                    error = %err,
                    "deferred session flush failed"
                );
                false
            }
        }
    }

    /// Drops this process's handle and releases its ownership. The record
    /// survives while other processes hold it.
    pub async fn release(&self, id: &str) -> bool {
        let session = match self.sessions.write() {
            Ok(mut sessions) => sessions.remove(id),
            Err(err) => {
                event!(Level::ERROR, session_id = id, error = %err, "session registry poisoned");
                None
            }
        };
        if let Some(session) = &session {
            self.complete_request(session).await;
        }
        self.client.delete_session(id, false).await
    }

    /// Invalidates `id` cluster-wide.
    pub async fn invalidate(&self, id: &str) -> bool {
        let session = match self.sessions.write() {
            Ok(mut sessions) => sessions.remove(id),
            Err(err) => {
                event!(Level::ERROR, session_id = id, error = %err, "session registry poisoned");
                None
            }
        };
        if let Some(session) = session {
            if let Err(err) = session.invalidate_local() {
                event!(Level::WARN, session_id = id, error = %err, "could not clear local session state");
            }
        }
        self.client.delete_session(id, true).await
    }

    pub fn live_sessions(&self) -> Result<Vec<SessionId>> {
        let mut ids: Vec<SessionId> = self.sessions.read()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Releases every live session, then stops the connection supervisor.
    /// Releases that cannot reach the store stay in the orphan queue.
    pub async fn shutdown(&self) -> Result<()> {
        let ids = self.live_sessions()?;
        let released = join_all(ids.iter().map(|id| self.release(id))).await;
        event!(
            Level::INFO,
            sessions = ids.len(),
            reached_store = released.iter().filter(|ok| **ok).count(),
            "session manager released live sessions"
        );
        self.client.supervisor().shutdown().await
    }
}

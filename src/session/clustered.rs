use super::config::SessionConfig;
use super::entry::LocalCacheEntry;
use crate::client::SessionReplicationClient;
use crate::core::{AttributeValue, Result, SessionError, SessionId, from_attribute, to_attribute};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{Level, event};

/// This process's view of one replicated session.
///
/// In write-through mode every mutation reaches the store before the call
/// returns, and reads go to the store unless a local write is still pending.
/// In deferred-write mode the attributes are pulled once on attach, all reads
/// and writes stay local, and [`ClusteredSession::flush`] replays the dirty
/// entries as one batched update.
///
/// Store outages never lose a local mutation: a failed write stays dirty and
/// is resent by the next flush.
pub struct ClusteredSession {
    id: SessionId,
    client: Arc<SessionReplicationClient>,
    config: Arc<SessionConfig>,
    entries: RwLock<HashMap<String, Arc<LocalCacheEntry>>>,
    /// Not persisted in the store yet; the next flush must create it.
    cluster_wide_new: AtomicBool,
    /// The full attribute set was pulled successfully.
    loaded: AtomicBool,
    valid: AtomicBool,
}

impl ClusteredSession {
    /// Attaches to session `id`.
    ///
    /// A deferred-write session that already exists in the cluster is loaded
    /// here. If the store is unreachable the session starts empty and
    /// uncached names are fetched lazily later.
    pub async fn attach(
        id: &str,
        client: Arc<SessionReplicationClient>,
        config: Arc<SessionConfig>,
        cluster_wide_new: bool,
    ) -> Result<Self> {
        let session = Self {
            id: id.to_string(),
            client,
            config,
            entries: RwLock::new(HashMap::new()),
            cluster_wide_new: AtomicBool::new(cluster_wide_new),
            loaded: AtomicBool::new(cluster_wide_new),
            valid: AtomicBool::new(true),
        };
        if session.config.deferred_write && !cluster_wide_new {
            session.load().await?;
        }
        Ok(session)
    }

    async fn load(&self) -> Result<()> {
        match self.client.get_attributes(&self.id).await {
            Ok(Some(attributes)) => {
                let mut entries = self.entries.write()?;
                for (name, value) in attributes {
                    let transient = self.config.is_transient(&name);
                    entries.insert(name, Arc::new(LocalCacheEntry::loaded(value, transient)));
                }
                self.loaded.store(true, Ordering::Release);
                event!(
                    Level::DEBUG,
                    session_id = %self.id,
                    attributes = entries.len(),
                    "session attributes loaded"
                );
            }
            Ok(None) => {
                // Expired or deleted elsewhere: recreate it on the next flush.
                self.cluster_wide_new.store(true, Ordering::Release);
                self.loaded.store(true, Ordering::Release);
            }
            Err(err) if err.is_retryable() => {
                event!(
                    Level::WARN,
                    session_id = %self.id,
                    error = %err,
                    "session load failed, continuing from local cache"
                );
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_deferred(&self) -> bool {
        self.config.deferred_write
    }

    /// True until the session has been persisted in the cluster.
    pub fn is_new(&self) -> bool {
        self.cluster_wide_new.load(Ordering::Acquire)
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub async fn get_attribute(&self, name: &str) -> Result<Option<AttributeValue>> {
        self.ensure_valid()?;
        let entry = self.local_entry(name)?;

        if self.config.is_transient(name) {
            return match entry {
                Some(entry) => entry.value(),
                None => Ok(None),
            };
        }

        if self.config.deferred_write {
            match entry {
                Some(entry) if !entry.needs_reload() => entry.value(),
                Some(entry) => self.reload(name, &entry).await,
                None if self.loaded.load(Ordering::Acquire) => Ok(None),
                None => self.fetch_uncached(name).await,
            }
        } else {
            if let Some(entry) = entry.as_ref().filter(|entry| entry.is_dirty()) {
                return entry.value();
            }
            match self.client.get_attribute(&self.id, name).await {
                Ok(value) => match entry {
                    Some(entry) => {
                        entry.refresh(value)?;
                        entry.value()
                    }
                    None => {
                        if let Some(value) = &value {
                            self.insert_if_absent(name, LocalCacheEntry::loaded(value.clone(), false))?;
                        }
                        Ok(value)
                    }
                },
                Err(err) => self.fallback(name, entry.as_ref(), err),
            }
        }
    }

    async fn reload(&self, name: &str, entry: &Arc<LocalCacheEntry>) -> Result<Option<AttributeValue>> {
        match self.client.get_attribute(&self.id, name).await {
            Ok(value) => {
                entry.refresh(value)?;
                entry.value()
            }
            Err(err) => self.fallback(name, Some(entry), err),
        }
    }

    async fn fetch_uncached(&self, name: &str) -> Result<Option<AttributeValue>> {
        match self.client.get_attribute(&self.id, name).await {
            Ok(Some(value)) => {
                let entry = self.insert_if_absent(name, LocalCacheEntry::loaded(value, false))?;
                entry.value()
            }
            Ok(None) => Ok(None),
            Err(err) => self.fallback(name, None, err),
        }
    }

    /// Serves the last known local value when the store is unreachable.
    fn fallback(
        &self,
        name: &str,
        entry: Option<&Arc<LocalCacheEntry>>,
        err: SessionError,
    ) -> Result<Option<AttributeValue>> {
        if !err.is_retryable() {
            return Err(err);
        }
        event!(
            Level::DEBUG,
            session_id = %self.id,
            attribute = name,
            error = %err,
            "store read failed, serving local value"
        );
        match entry {
            Some(entry) => entry.value(),
            None => Ok(None),
        }
    }

    /// Sets `name`. Write-through sessions return the store error when the
    /// write could not be replicated; the value is kept locally and retried
    /// by the next flush.
    ///
    /// Setting [`AttributeValue::Null`] removes the attribute.
    pub async fn set_attribute(&self, name: &str, value: AttributeValue) -> Result<()> {
        if value.is_null() {
            return self.remove_attribute(name).await;
        }
        self.ensure_valid()?;
        let transient = self.config.is_transient(name);
        let entry = self.insert_if_absent(name, LocalCacheEntry::empty(transient))?;
        let version = entry.write(value.clone())?;
        if transient || self.config.deferred_write {
            return Ok(());
        }

        match self.client.set_attribute(&self.id, name, Some(&value)).await {
            Ok(_) => {
                entry.mark_clean(version)?;
                self.cluster_wide_new.store(false, Ordering::Release);
                Ok(())
            }
            Err(err) => {
                event!(
                    Level::WARN,
                    session_id = %self.id,
                    attribute = name,
                    error = %err,
                    "write-through replication failed"
                );
                Err(err)
            }
        }
    }

    pub async fn remove_attribute(&self, name: &str) -> Result<()> {
        self.ensure_valid()?;
        let transient = self.config.is_transient(name);
        let entry = self.insert_if_absent(name, LocalCacheEntry::empty(transient))?;
        let version = entry.remove()?;
        if transient {
            self.evict(name, &entry)?;
            return Ok(());
        }
        if self.config.deferred_write {
            return Ok(());
        }

        match self.client.delete_attribute(&self.id, name).await {
            Ok(_) => {
                if entry.mark_clean(version)? {
                    self.evict(name, &entry)?;
                }
                self.cluster_wide_new.store(false, Ordering::Release);
                Ok(())
            }
            Err(err) => {
                event!(
                    Level::WARN,
                    session_id = %self.id,
                    attribute = name,
                    error = %err,
                    "write-through removal failed"
                );
                Err(err)
            }
        }
    }

    pub async fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.get_attribute(name).await? {
            Some(value) => Ok(Some(from_attribute(&value)?)),
            None => Ok(None),
        }
    }

    pub async fn set_as<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        self.set_attribute(name, to_attribute(value)?).await
    }

    /// Attribute names visible to this process, transient ones included.
    pub async fn attribute_names(&self) -> Result<BTreeSet<String>> {
        self.ensure_valid()?;
        if self.config.deferred_write && self.loaded.load(Ordering::Acquire) {
            return self.local_names();
        }

        match self.client.get_attribute_names(&self.id).await {
            Ok(remote) => {
                let mut names = remote.unwrap_or_default();
                let entries = self.entries.read()?;
                for (name, entry) in entries.iter() {
                    if entry.is_removed() {
                        if entry.is_dirty() || entry.is_transient() {
                            names.remove(name);
                        }
                    } else if entry.is_dirty() || entry.is_transient() {
                        names.insert(name.clone());
                    }
                }
                Ok(names)
            }
            Err(err) if err.is_retryable() => {
                event!(
                    Level::DEBUG,
                    session_id = %self.id,
                    error = %err,
                    "store unavailable, listing cached names"
                );
                self.local_names()
            }
            Err(err) => Err(err),
        }
    }

    fn local_names(&self) -> Result<BTreeSet<String>> {
        let entries = self.entries.read()?;
        let mut names = BTreeSet::new();
        for (name, entry) in entries.iter() {
            if entry.value()?.is_some() {
                names.insert(name.clone());
            }
        }
        Ok(names)
    }

    /// True when deferred-write changes wait for a flush. A session not yet
    /// persisted in the cluster always needs one.
    pub fn session_changed(&self) -> Result<bool> {
        Ok(self.config.deferred_write && self.needs_flush()?)
    }

    /// True when a flush would send something, in either mode.
    pub fn needs_flush(&self) -> Result<bool> {
        if !self.is_valid() {
            return Ok(false);
        }
        if self.is_new() {
            return Ok(true);
        }
        Ok(self.entries.read()?.values().any(|entry| entry.is_dirty()))
    }

    /// Replays every dirty, non-transient entry as one batched update.
    ///
    /// All-or-nothing: on failure no entry is marked clean and the next flush
    /// resends them, merged with anything written since. Removed entries are
    /// evicted once their tombstone is stored. Returns false when there was
    /// nothing to send.
    pub async fn flush(&self) -> Result<bool> {
        if !self.is_valid() {
            return Ok(false);
        }

        let mut pending = Vec::new();
        {
            let entries = self.entries.read()?;
            for (name, entry) in entries.iter() {
                if entry.is_transient() {
                    continue;
                }
                if let Some(snapshot) = entry.pending()? {
                    pending.push((name.clone(), Arc::clone(entry), snapshot));
                }
            }
        }
        if pending.is_empty() && !self.is_new() {
            return Ok(false);
        }

        let updates: BTreeMap<String, Option<AttributeValue>> = pending
            .iter()
            .map(|(name, _, snapshot)| (name.clone(), snapshot.value.clone()))
            .collect();

        if let Err(err) = self.client.update_attributes(&self.id, &updates).await {
            event!(
                Level::WARN,
                session_id = %self.id,
                pending = updates.len(),
                error = %err,
                "session flush failed, changes kept for next flush"
            );
            return Err(err);
        }

        for (name, entry, snapshot) in &pending {
            if entry.mark_clean(snapshot.version)? && snapshot.removed {
                self.evict(name, entry)?;
            }
        }
        self.cluster_wide_new.store(false, Ordering::Release);
        event!(
            Level::DEBUG,
            session_id = %self.id,
            flushed = updates.len(),
            "session flushed"
        );
        Ok(true)
    }

    /// Marks `name` stale so the next deferred read fetches it again.
    /// Returns false if the name is not cached.
    pub fn mark_reload(&self, name: &str) -> Result<bool> {
        match self.local_entry(name)? {
            Some(entry) => {
                entry.mark_reload();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Marks every cached entry stale and lets uncached names be fetched.
    pub fn mark_all_for_reload(&self) -> Result<()> {
        for entry in self.entries.read()?.values() {
            entry.mark_reload();
        }
        self.loaded.store(false, Ordering::Release);
        Ok(())
    }

    /// Cached entry for `name`, if any.
    pub fn local_entry(&self, name: &str) -> Result<Option<Arc<LocalCacheEntry>>> {
        Ok(self.entries.read()?.get(name).cloned())
    }

    /// Drops the local state; later calls fail with
    /// [`SessionError::InvalidSession`].
    pub(crate) fn invalidate_local(&self) -> Result<()> {
        self.valid.store(false, Ordering::Release);
        self.entries.write()?.clear();
        Ok(())
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(SessionError::InvalidSession(self.id.clone()))
        }
    }

    fn insert_if_absent(&self, name: &str, entry: LocalCacheEntry) -> Result<Arc<LocalCacheEntry>> {
        let mut entries = self.entries.write()?;
        Ok(Arc::clone(
            entries
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(entry)),
        ))
    }

    /// Removes `entry` unless it was replaced or written to again.
    fn evict(&self, name: &str, entry: &Arc<LocalCacheEntry>) -> Result<()> {
        let mut entries = self.entries.write()?;
        let same = entries
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, entry));
        if same && !entry.is_dirty() && (entry.is_removed() || entry.is_transient()) {
            entries.remove(name);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ClusteredSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteredSession")
            .field("id", &self.id)
            .field("deferred_write", &self.config.deferred_write)
            .field("new", &self.is_new())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionSupervisor, StoreConfig};
    use crate::core::OwnerId;
    use crate::store::InMemoryCluster;
    use serde_json::json;
    use std::time::Duration;

    fn client(cluster: &Arc<InMemoryCluster>, owner: &str) -> Arc<SessionReplicationClient> {
        let config = StoreConfig::new("sessions").retry_interval(Duration::from_millis(40));
        let supervisor = ConnectionSupervisor::new(config, Arc::new(cluster.connector())).unwrap();
        Arc::new(SessionReplicationClient::with_default_codec(
            OwnerId::new(owner),
            supervisor,
        ))
    }

    #[tokio::test]
    async fn test_deferred_writes_stay_local_until_flush() {
        let cluster = InMemoryCluster::new();
        let p1 = client(&cluster, "p1");
        let session = ClusteredSession::attach("s1", p1.clone(), Arc::new(SessionConfig::deferred()), true)
            .await
            .unwrap();

        session.set_attribute("a", json!(1)).await.unwrap();
        assert!(session.session_changed().unwrap());
        assert_eq!(p1.get_attribute_names("s1").await.unwrap(), None);

        assert!(session.flush().await.unwrap());
        assert!(!session.session_changed().unwrap());
        assert!(!session.is_new());
        assert_eq!(p1.get_attribute("s1", "a").await.unwrap(), Some(json!(1)));
        assert!(!session.flush().await.unwrap());
    }

    #[tokio::test]
    async fn test_setting_null_removes_attribute() {
        let cluster = InMemoryCluster::new();
        let p1 = client(&cluster, "p1");
        for config in [SessionConfig::write_through(), SessionConfig::deferred()] {
            let session = ClusteredSession::attach("s1", p1.clone(), Arc::new(config), true)
                .await
                .unwrap();
            session.set_attribute("a", json!(1)).await.unwrap();
            session.set_attribute("b", json!(2)).await.unwrap();
            session.flush().await.unwrap();

            session.set_attribute("a", json!(null)).await.unwrap();
            assert_eq!(session.get_attribute("a").await.unwrap(), None);
            session.flush().await.unwrap();

            let names: Vec<String> = session.attribute_names().await.unwrap().into_iter().collect();
            assert_eq!(names, vec!["b".to_string()]);
            let stored = p1.get_attribute_names("s1").await.unwrap().unwrap();
            assert!(!stored.contains("a"));
            assert!(p1.delete_session("s1", true).await);
        }
    }

    #[tokio::test]
    async fn test_new_session_is_persisted_even_without_attributes() {
        let cluster = InMemoryCluster::new();
        let p1 = client(&cluster, "p1");
        let session = ClusteredSession::attach("s1", p1.clone(), Arc::new(SessionConfig::deferred()), true)
            .await
            .unwrap();

        assert!(session.session_changed().unwrap());
        assert!(session.flush().await.unwrap());
        let map = cluster.map("sessions").unwrap();
        let state = map.peek("s1").await.unwrap();
        assert!(state.is_owned_by("p1"));
        assert!(state.attributes.is_empty());
    }

    #[tokio::test]
    async fn test_removed_entries_are_evicted_after_flush() {
        let cluster = InMemoryCluster::new();
        let p1 = client(&cluster, "p1");
        p1.set_attribute("s1", "a", Some(&json!("x"))).await.unwrap();

        let session = ClusteredSession::attach("s1", p1.clone(), Arc::new(SessionConfig::deferred()), false)
            .await
            .unwrap();
        assert_eq!(session.get_attribute("a").await.unwrap(), Some(json!("x")));

        session.remove_attribute("a").await.unwrap();
        assert_eq!(session.get_attribute("a").await.unwrap(), None);
        assert!(session.local_entry("a").unwrap().is_some());

        session.flush().await.unwrap();
        assert!(session.local_entry("a").unwrap().is_none());
        assert_eq!(p1.get_attribute_names("s1").await.unwrap(), Some(BTreeSet::new()));
    }

    #[tokio::test]
    async fn test_transient_attributes_are_never_replicated() {
        let cluster = InMemoryCluster::new();
        let p1 = client(&cluster, "p1");
        let config = Arc::new(SessionConfig::write_through().transient("token"));
        let session = ClusteredSession::attach("s1", p1.clone(), config, true).await.unwrap();

        session.set_attribute("token", json!("secret")).await.unwrap();
        session.set_attribute("user", json!("ada")).await.unwrap();

        assert_eq!(session.get_attribute("token").await.unwrap(), Some(json!("secret")));
        assert_eq!(p1.get_attribute("s1", "token").await.unwrap(), None);
        let names = session.attribute_names().await.unwrap();
        assert!(names.contains("token") && names.contains("user"));
    }

    #[tokio::test]
    async fn test_invalidated_session_rejects_calls() {
        let cluster = InMemoryCluster::new();
        let p1 = client(&cluster, "p1");
        let session = ClusteredSession::attach("s1", p1, Arc::new(SessionConfig::deferred()), true)
            .await
            .unwrap();
        session.invalidate_local().unwrap();

        assert!(!session.is_valid());
        assert!(matches!(
            session.get_attribute("a").await,
            Err(SessionError::InvalidSession(_))
        ));
        assert!(!session.flush().await.unwrap());
    }

    #[tokio::test]
    async fn test_typed_helpers_round_trip() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Cart {
            items: Vec<String>,
        }

        let cluster = InMemoryCluster::new();
        let p1 = client(&cluster, "p1");
        let session = ClusteredSession::attach("s1", p1, Arc::new(SessionConfig::write_through()), true)
            .await
            .unwrap();

        let cart = Cart {
            items: vec!["book".into()],
        };
        session.set_as("cart", &cart).await.unwrap();
        assert_eq!(session.get_as::<Cart>("cart").await.unwrap(), Some(cart));
    }
}

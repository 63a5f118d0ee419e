/// Filter applied to `(key, state)` pairs by the bulk read calls.
pub type EntryPredicate<'a> = &'a (dyn Fn(&str, &SessionState) -> bool + Send + Sync);

/// Identifier returned by [`DistributedMap::add_entry_listener`].
pub type ListenerId = String;

/// Kind of change observed on a map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryEventKind {
    Added,
    Updated,
    Removed,
    Expired,
}

/// Change notification delivered to entry listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryEvent {
    pub map_name: String,
    pub key: String,
    pub kind: EntryEventKind,
}

/// Receives entry events. Called synchronously by the store; implementations
/// must not block.
pub trait EntryListener: Send + Sync {
    fn on_event(&self, event: &EntryEvent);
}

impl<F> EntryListener for F
where
    F: Fn(&EntryEvent) + Send + Sync,
{
    fn on_event(&self, event: &EntryEvent) {
        self(event)
    }
}

/// Key-addressable store holding one [`SessionState`] per session id.
///
/// Any call may fail when the store is unreachable. Failures are always
/// reported as errors, never as empty results.
#[async_trait]
pub trait DistributedMap: Send + Sync {
    /// Name of the map.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<SessionState>>;

    /// Stores `state`, returning the previous record.
    async fn put(&self, key: &str, state: SessionState) -> Result<Option<SessionState>>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn size(&self) -> Result<usize>;

    /// Runs `operation` with exclusive access to `key`.
    async fn execute_on_key(
        &self,
        key: &str,
        operation: &SessionOperation,
    ) -> Result<OperationResult>;

    async fn key_set(&self, predicate: Option<EntryPredicate<'_>>) -> Result<Vec<String>>;

    async fn entry_set(
        &self,
        predicate: Option<EntryPredicate<'_>>,
    ) -> Result<Vec<(String, SessionState)>>;

    async fn values(&self, predicate: Option<EntryPredicate<'_>>) -> Result<Vec<SessionState>> {
        let entries = self.entry_set(predicate).await?;
        Ok(entries.into_iter().map(|(_, state)| state).collect())
    }

    async fn add_entry_listener(&self, listener: Arc<dyn EntryListener>) -> Result<ListenerId>;

    async fn remove_entry_listener(&self, id: &str) -> Result<bool>;

    /// Sets the map-level expiry. `None` disables expiry.
    async fn set_time_to_live(&self, ttl: Option<Duration>) -> Result<()>;
}

/// Opens maps on the store. One connect call is one reconnect attempt.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, config: &StoreConfig) -> Result<Arc<dyn DistributedMap>>;
}

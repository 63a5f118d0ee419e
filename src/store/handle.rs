/// Live reference to the session map, as returned by
/// [`ConnectionSupervisor::ensure_ready`](crate::connection::ConnectionSupervisor::ensure_ready).
///
/// Every call is bounded by the operation timeout; a timed-out call is
/// reported as [`SessionError::StoreUnavailable`]. Cloning is cheap and all
/// clones talk to the same map.
#[derive(Clone)]
pub struct StoreHandle {
    map: Arc<dyn DistributedMap>,
    operation_timeout: Duration,
    generation: u64,
}

impl StoreHandle {
    pub fn new(map: Arc<dyn DistributedMap>, operation_timeout: Duration, generation: u64) -> Self {
        Self {
            map,
            operation_timeout,
            generation,
        }
    }

    pub fn map_name(&self) -> &str {
        self.map.name()
    }

    /// Connection generation this handle belongs to; bumped on each reconnect.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    async fn bounded<T, F>(&self, call: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::StoreUnavailable(format!(
                "{} on map '{}' timed out after {:?}",
                call,
                self.map.name(),
                self.operation_timeout
            ))),
        }
    }

    pub async fn execute(&self, key: &str, operation: &SessionOperation) -> Result<OperationResult> {
        self.bounded(operation.kind().as_str(), self.map.execute_on_key(key, operation))
            .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<SessionState>> {
        self.bounded("get", self.map.get(key)).await
    }

    pub async fn put(&self, key: &str, state: SessionState) -> Result<Option<SessionState>> {
        self.bounded("put", self.map.put(key, state)).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.bounded("delete", self.map.delete(key)).await
    }

    pub async fn size(&self) -> Result<usize> {
        self.bounded("size", self.map.size()).await
    }

    pub async fn key_set(&self, predicate: Option<EntryPredicate<'_>>) -> Result<Vec<String>> {
        self.bounded("key_set", self.map.key_set(predicate)).await
    }

    pub async fn entry_set(
        &self,
        predicate: Option<EntryPredicate<'_>>,
    ) -> Result<Vec<(String, SessionState)>> {
        self.bounded("entry_set", self.map.entry_set(predicate)).await
    }

    pub async fn values(&self, predicate: Option<EntryPredicate<'_>>) -> Result<Vec<SessionState>> {
        self.bounded("values", self.map.values(predicate)).await
    }

    pub async fn add_entry_listener(&self, listener: Arc<dyn EntryListener>) -> Result<ListenerId> {
        self.bounded("add_entry_listener", self.map.add_entry_listener(listener))
            .await
    }

    pub async fn remove_entry_listener(&self, id: &str) -> Result<bool> {
        self.bounded("remove_entry_listener", self.map.remove_entry_listener(id))
            .await
    }

    pub async fn set_time_to_live(&self, ttl: Option<Duration>) -> Result<()> {
        self.bounded("set_time_to_live", self.map.set_time_to_live(ttl))
            .await
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("map", &self.map.name())
            .field("operation_timeout", &self.operation_timeout)
            .field("generation", &self.generation)
            .finish()
    }
}

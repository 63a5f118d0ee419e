struct StoredRecord {
    bytes: Bytes,
    written_at: Instant,
}

#[derive(Default)]
struct InMemoryRecords {
    entries: HashMap<String, StoredRecord>,
    ttl: Option<Duration>,
}

impl InMemoryRecords {
    /// Drops `key` when it outlived the ttl. Returns true if it expired.
    fn expire(&mut self, key: &str, now: Instant) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        let expired = self
            .entries
            .get(key)
            .is_some_and(|record| now.duration_since(record.written_at) >= ttl);
        if expired {
            self.entries.remove(key);
        }
        expired
    }

    fn expire_all(&mut self, now: Instant) -> Vec<String> {
        let Some(ttl) = self.ttl else {
            return Vec::new();
        };
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, record)| now.duration_since(record.written_at) >= ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        expired
    }

    fn decoded(&self) -> Result<Vec<(String, SessionState)>> {
        self.entries
            .iter()
            .map(|(key, record)| Ok((key.clone(), decode_state(&record.bytes)?)))
            .collect()
    }
}

/// In-process [`DistributedMap`].
///
/// Records are kept in their wire encoding and every operation is shipped
/// through the wire codec before it is applied, the way a remote member would
/// receive it. A single lock gives each operation exclusive access to its key.
pub struct InMemoryDistributedMap {
    name: String,
    records: Mutex<InMemoryRecords>,
    available: Arc<AtomicBool>,
    latency_ms: AtomicU64,
    listeners: StdRwLock<HashMap<ListenerId, Arc<dyn EntryListener>>>,
    operations: AtomicU64,
}

impl InMemoryDistributedMap {
    /// Creates a standalone map with its own availability switch.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_availability(name, Arc::new(AtomicBool::new(true)))
    }

    fn with_availability(name: impl Into<String>, available: Arc<AtomicBool>) -> Self {
        Self {
            name: name.into(),
            records: Mutex::new(InMemoryRecords::default()),
            available,
            latency_ms: AtomicU64::new(0),
            listeners: StdRwLock::new(HashMap::new()),
            operations: AtomicU64::new(0),
        }
    }

    /// Simulates the store going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Adds a fixed delay to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `execute_on_key` calls that reached the records.
    pub fn operations_executed(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    /// Reads a record regardless of availability. Intended for assertions.
    pub async fn peek(&self, key: &str) -> Option<SessionState> {
        let records = self.records.lock().await;
        records
            .entries
            .get(key)
            .and_then(|record| decode_state(&record.bytes).ok())
    }

    async fn reachable(&self, call: &str) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SessionError::StoreUnavailable(format!(
                "map '{}' unreachable during {}",
                self.name, call
            )));
        }
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            sleep(Duration::from_millis(latency)).await;
        }
        Ok(())
    }

    fn event(&self, key: &str, kind: EntryEventKind) -> EntryEvent {
        EntryEvent {
            map_name: self.name.clone(),
            key: key.to_string(),
            kind,
        }
    }

    fn notify(&self, events: Vec<EntryEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Arc<dyn EntryListener>> = match self.listeners.read() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(err) => {
                event!(Level::WARN, map = %self.name, error = %err, "listener registry poisoned");
                return;
            }
        };
        for entry_event in &events {
            for listener in &listeners {
                listener.on_event(entry_event);
            }
        }
    }
}

#[async_trait]
impl DistributedMap for InMemoryDistributedMap {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<SessionState>> {
        self.reachable("get").await?;
        let mut events = Vec::new();
        let state = {
            let mut records = self.records.lock().await;
            if records.expire(key, Instant::now()) {
                events.push(self.event(key, EntryEventKind::Expired));
            }
            match records.entries.get(key) {
                Some(record) => Some(decode_state(&record.bytes)?),
                None => None,
            }
        };
        self.notify(events);
        Ok(state)
    }

    async fn put(&self, key: &str, state: SessionState) -> Result<Option<SessionState>> {
        self.reachable("put").await?;
        let bytes = encode_state(&state);
        let previous = {
            let mut records = self.records.lock().await;
            let now = Instant::now();
            records.expire(key, now);
            records.entries.insert(
                key.to_string(),
                StoredRecord {
                    bytes,
                    written_at: now,
                },
            )
        };
        let kind = if previous.is_some() {
            EntryEventKind::Updated
        } else {
            EntryEventKind::Added
        };
        self.notify(vec![self.event(key, kind)]);
        previous
            .map(|record| decode_state(&record.bytes))
            .transpose()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.reachable("delete").await?;
        let removed = {
            let mut records = self.records.lock().await;
            records.entries.remove(key).is_some()
        };
        if removed {
            self.notify(vec![self.event(key, EntryEventKind::Removed)]);
        }
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        self.reachable("size").await?;
        let (size, expired) = {
            let mut records = self.records.lock().await;
            let expired = records.expire_all(Instant::now());
            (records.entries.len(), expired)
        };
        self.notify(
            expired
                .iter()
                .map(|key| self.event(key, EntryEventKind::Expired))
                .collect(),
        );
        Ok(size)
    }

    async fn execute_on_key(
        &self,
        key: &str,
        operation: &SessionOperation,
    ) -> Result<OperationResult> {
        self.reachable(operation.kind().as_str()).await?;

        let wire = encode_operation(operation);
        let operation = match decode_record(&wire)? {
            WireRecord::Operation(operation) => operation,
            WireRecord::State(_) => {
                return Err(SessionError::InvalidRecord(
                    "session state record sent as an operation".to_string(),
                ));
            }
        };
        self.operations.fetch_add(1, Ordering::SeqCst);

        let mut events = Vec::new();
        let result = {
            let mut records = self.records.lock().await;
            let now = Instant::now();
            if records.expire(key, now) {
                events.push(self.event(key, EntryEventKind::Expired));
            }
            let current = match records.entries.get(key) {
                Some(record) => Some(decode_state(&record.bytes)?),
                None => None,
            };
            let existed = current.is_some();
            let applied = operation.apply(current);
            match applied.state {
                Some(state) => {
                    let bytes = encode_state(&state);
                    // Any operation that keeps the record alive resets its ttl.
                    let changed = match records.entries.get_mut(key) {
                        Some(record) if record.bytes == bytes => {
                            record.written_at = now;
                            false
                        }
                        _ => true,
                    };
                    if changed {
                        records.entries.insert(
                            key.to_string(),
                            StoredRecord {
                                bytes,
                                written_at: now,
                            },
                        );
                        let kind = if existed {
                            EntryEventKind::Updated
                        } else {
                            EntryEventKind::Added
                        };
                        events.push(self.event(key, kind));
                    }
                }
                None => {
                    if existed {
                        records.entries.remove(key);
                        events.push(self.event(key, EntryEventKind::Removed));
                    }
                }
            }
            applied.result
        };
        self.notify(events);
        Ok(result)
    }

    async fn key_set(&self, predicate: Option<EntryPredicate<'_>>) -> Result<Vec<String>> {
        let entries = self.entry_set(predicate).await?;
        Ok(entries.into_iter().map(|(key, _)| key).collect())
    }

    async fn entry_set(
        &self,
        predicate: Option<EntryPredicate<'_>>,
    ) -> Result<Vec<(String, SessionState)>> {
        self.reachable("entry_set").await?;
        let (entries, expired) = {
            let mut records = self.records.lock().await;
            let expired = records.expire_all(Instant::now());
            (records.decoded()?, expired)
        };
        self.notify(
            expired
                .iter()
                .map(|key| self.event(key, EntryEventKind::Expired))
                .collect(),
        );
        let mut entries: Vec<(String, SessionState)> = match predicate {
            Some(predicate) => entries
                .into_iter()
                .filter(|(key, state)| predicate(key, state))
                .collect(),
            None => entries,
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn add_entry_listener(&self, listener: Arc<dyn EntryListener>) -> Result<ListenerId> {
        self.reachable("add_entry_listener").await?;
        let id = uuid::Uuid::new_v4().to_string();
        self.listeners.write()?.insert(id.clone(), listener);
        Ok(id)
    }

    async fn remove_entry_listener(&self, id: &str) -> Result<bool> {
        self.reachable("remove_entry_listener").await?;
        Ok(self.listeners.write()?.remove(id).is_some())
    }

    async fn set_time_to_live(&self, ttl: Option<Duration>) -> Result<()> {
        self.reachable("set_time_to_live").await?;
        let mut records = self.records.lock().await;
        records.ttl = ttl;
        Ok(())
    }
}

/// A set of named in-memory maps shared by every simulated process.
pub struct InMemoryCluster {
    maps: StdMutex<HashMap<String, Arc<InMemoryDistributedMap>>>,
    available: Arc<AtomicBool>,
}

impl InMemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            maps: StdMutex::new(HashMap::new()),
            available: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Returns the named map, creating it on first use.
    pub fn map(&self, name: &str) -> Result<Arc<InMemoryDistributedMap>> {
        let mut maps = self.maps.lock()?;
        let map = maps.entry(name.to_string()).or_insert_with(|| {
            Arc::new(InMemoryDistributedMap::with_availability(
                name,
                Arc::clone(&self.available),
            ))
        });
        Ok(Arc::clone(map))
    }

    /// Takes the whole cluster down or brings it back. Existing handles start
    /// failing immediately and new connections are refused.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Creates a connector for one simulated process.
    pub fn connector(self: &Arc<Self>) -> InMemoryConnector {
        InMemoryConnector {
            cluster: Arc::clone(self),
            attempts: AtomicU64::new(0),
        }
    }
}

/// [`StoreConnector`] for an [`InMemoryCluster`].
pub struct InMemoryConnector {
    cluster: Arc<InMemoryCluster>,
    attempts: AtomicU64,
}

impl InMemoryConnector {
    /// Number of connect attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreConnector for InMemoryConnector {
    async fn connect(&self, config: &StoreConfig) -> Result<Arc<dyn DistributedMap>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.cluster.is_available() {
            return Err(SessionError::StoreUnavailable(format!(
                "connection to {}:{} refused",
                config.host, config.port
            )));
        }
        let map: Arc<dyn DistributedMap> = self.cluster.map(&config.map_name)?;
        Ok(map)
    }
}

#[cfg(test)]
mod in_memory_tests {
    use super::*;
    use std::collections::BTreeMap;

    fn write(owner: &str, name: &str, value: &[u8]) -> SessionOperation {
        let mut updates = BTreeMap::new();
        updates.insert(name.to_string(), Some(value.to_vec()));
        SessionOperation::UpdateAttributes {
            owner_id: owner.to_string(),
            updates,
        }
    }

    #[tokio::test]
    async fn test_execute_creates_and_updates_records() {
        let map = InMemoryDistributedMap::new("sessions");
        map.execute_on_key("s1", &write("p1", "a", b"1")).await.unwrap();

        let state = map.get("s1").await.unwrap().unwrap();
        assert!(state.is_owned_by("p1"));
        assert_eq!(state.attributes.get("a"), Some(&b"1".to_vec()));
        assert_eq!(map.size().await.unwrap(), 1);
        assert_eq!(map.operations_executed(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_map_fails_every_call() {
        let map = InMemoryDistributedMap::new("sessions");
        map.set_available(false);
        assert!(matches!(
            map.get("s1").await,
            Err(SessionError::StoreUnavailable(_))
        ));
        assert!(matches!(
            map.execute_on_key("s1", &write("p1", "a", b"1")).await,
            Err(SessionError::StoreUnavailable(_))
        ));
        assert_eq!(map.operations_executed(), 0);
    }

    #[tokio::test]
    async fn test_listeners_see_lifecycle_events() {
        let map = InMemoryDistributedMap::new("sessions");
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = map
            .add_entry_listener(Arc::new(move |event: &EntryEvent| {
                sink.lock().unwrap().push((event.key.clone(), event.kind));
            }))
            .await
            .unwrap();

        map.execute_on_key("s1", &write("p1", "a", b"1")).await.unwrap();
        map.execute_on_key("s1", &write("p1", "a", b"2")).await.unwrap();
        // Same bytes again: nothing changes, nothing is reported.
        map.execute_on_key("s1", &write("p1", "a", b"2")).await.unwrap();
        map.execute_on_key(
            "s1",
            &SessionOperation::DeleteSession {
                owner_id: "p1".into(),
                invalidate: false,
            },
        )
        .await
        .unwrap();

        assert!(map.remove_entry_listener(&id).await.unwrap());
        map.execute_on_key("s2", &write("p1", "a", b"1")).await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("s1".to_string(), EntryEventKind::Added),
                ("s1".to_string(), EntryEventKind::Updated),
                ("s1".to_string(), EntryEventKind::Removed),
            ]
        );
    }

    #[tokio::test]
    async fn test_records_expire_after_ttl() {
        let map = InMemoryDistributedMap::new("sessions");
        map.set_time_to_live(Some(Duration::from_millis(30)))
            .await
            .unwrap();
        map.execute_on_key("s1", &write("p1", "a", b"1")).await.unwrap();
        assert!(map.get("s1").await.unwrap().is_some());

        sleep(Duration::from_millis(60)).await;
        assert!(map.get("s1").await.unwrap().is_none());
        assert_eq!(map.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reads_and_rewrites_keep_session_alive() {
        let map = InMemoryDistributedMap::new("sessions");
        map.set_time_to_live(Some(Duration::from_millis(100)))
            .await
            .unwrap();
        map.execute_on_key("s1", &write("p1", "a", b"1")).await.unwrap();

        let read = SessionOperation::GetSessionState {
            owner_id: "p1".into(),
        };
        for round in 0..6 {
            sleep(Duration::from_millis(40)).await;
            if round % 2 == 0 {
                map.execute_on_key("s1", &read).await.unwrap();
            } else {
                map.execute_on_key("s1", &write("p1", "a", b"1")).await.unwrap();
            }
            assert!(map.get("s1").await.unwrap().is_some(), "expired in round {}", round);
        }

        sleep(Duration::from_millis(150)).await;
        assert!(map.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_predicates_filter_bulk_reads() {
        let map = InMemoryDistributedMap::new("sessions");
        map.execute_on_key("s1", &write("p1", "a", b"1")).await.unwrap();
        map.execute_on_key("s2", &write("p2", "a", b"1")).await.unwrap();
        map.execute_on_key("s3", &write("p1", "b", b"1")).await.unwrap();

        let owned_by_p1 = |_: &str, state: &SessionState| state.is_owned_by("p1");
        let keys = map.key_set(Some(&owned_by_p1)).await.unwrap();
        assert_eq!(keys, vec!["s1".to_string(), "s3".to_string()]);
        assert_eq!(map.values(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cluster_outage_refuses_connections() {
        let cluster = InMemoryCluster::new();
        let connector = cluster.connector();
        let config = StoreConfig::new("sessions");

        assert!(connector.connect(&config).await.is_ok());
        cluster.set_available(false);
        assert!(matches!(
            connector.connect(&config).await,
            Err(SessionError::StoreUnavailable(_))
        ));
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_handle_times_out_slow_calls() {
        let map = Arc::new(InMemoryDistributedMap::new("sessions"));
        map.set_latency(Duration::from_millis(200));
        let handle = StoreHandle::new(map, Duration::from_millis(20), 1);
        let err = handle.size().await.unwrap_err();
        assert!(err.is_retryable());
    }
}

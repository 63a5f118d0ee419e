use super::config::StoreConfig;
use super::orphans::OrphanQueue;
use crate::core::{Result, SessionError};
use crate::store::{StoreConnector, StoreHandle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{Instrument, Level, event, info_span};

/// Owns the connection to the session store.
///
/// A failed connection is retried at most once per `retry_interval`; calls
/// made in between fail fast with [`SessionError::StoreUnavailable`]. Only
/// one reconnect attempt runs at a time. After every successful reconnect, and
/// on probe ticks while entries remain, the orphan queue is drained in FIFO
/// order. A deletion that keeps failing stays at the head of the queue but
/// never takes the connection down.
pub struct ConnectionSupervisor {
    config: StoreConfig,
    connector: Arc<dyn StoreConnector>,
    orphans: Arc<OrphanQueue>,
    /// Current handle; replaced on reconnect, never cached by callers.
    current: StdRwLock<Option<StoreHandle>>,
    connected: AtomicBool,
    shut_down: AtomicBool,
    last_attempt: StdMutex<Option<Instant>>,
    /// Serializes the check-then-reconnect decision.
    reconnect_lock: Mutex<()>,
    /// One drain at a time, so replays keep their order.
    drain_lock: Mutex<()>,
    generation: AtomicU64,
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    worker: StdMutex<Option<ProbeWorker>>,
}

/// Connection supervisor statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStats {
    pub connected: bool,
    pub generation: u64,
    pub connect_attempts: u64,
    pub connect_successes: u64,
    pub connect_failures: u64,
    pub pending_orphans: usize,
}

impl std::fmt::Display for SupervisorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Supervisor Stats: connected={} generation={} attempts={} ok={} failed={} orphans={}",
            self.connected,
            self.generation,
            self.connect_attempts,
            self.connect_successes,
            self.connect_failures,
            self.pending_orphans
        )
    }
}

impl ConnectionSupervisor {
    pub fn new(config: StoreConfig, connector: Arc<dyn StoreConnector>) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            connector,
            orphans: Arc::new(OrphanQueue::new()),
            current: StdRwLock::new(None),
            connected: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            last_attempt: StdMutex::new(None),
            reconnect_lock: Mutex::new(()),
            drain_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            worker: StdMutex::new(None),
        }))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn orphans(&self) -> &Arc<OrphanQueue> {
        &self.orphans
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Result<SupervisorStats> {
        Ok(SupervisorStats {
            connected: self.is_connected(),
            generation: self.generation.load(Ordering::SeqCst),
            connect_attempts: self.attempts.load(Ordering::SeqCst),
            connect_successes: self.successes.load(Ordering::SeqCst),
            connect_failures: self.failures.load(Ordering::SeqCst),
            pending_orphans: self.orphans.len()?,
        })
    }

    /// Spawns the background probe and makes a first connection attempt.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut worker = self.worker.lock()?;
            if worker.is_none() {
                *worker = Some(ProbeWorker::spawn(self));
            }
        }
        if let Err(err) = self.ensure_ready().await {
            event!(Level::WARN, error = %err, "initial session store connection failed");
        }
        Ok(())
    }

    /// Returns a usable store handle, reconnecting if allowed.
    pub async fn ensure_ready(&self) -> Result<StoreHandle> {
        if let Some(handle) = self.ready_handle()? {
            return Ok(handle);
        }
        self.check_rate_limit()?;

        let _guard = self.reconnect_lock.lock().await;
        // Another caller may have reconnected, or failed, while we waited.
        if let Some(handle) = self.ready_handle()? {
            return Ok(handle);
        }
        self.check_rate_limit()?;

        self.reconnect()
            .instrument(info_span!("session.store.reconnect", map = %self.config.map_name))
            .await
    }

    /// Reports a failed store call. The next `ensure_ready` reconnects.
    pub fn mark_failed(&self, reason: &SessionError) {
        if self.connected.swap(false, Ordering::AcqRel) {
            event!(
                Level::WARN,
                map = %self.config.map_name,
                error = %reason,
                "session store connection marked failed"
            );
        }
    }

    /// Stops the probe task within `shutdown_timeout` and drops the handle.
    ///
    /// Queued orphans stay in memory; later `ensure_ready` calls fail with
    /// [`SessionError::ShutDown`].
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let worker = self.worker.lock()?.take();
        if let Some(worker) = worker {
            worker.stop(self.config.shutdown_timeout).await;
        }
        self.connected.store(false, Ordering::Release);
        *self.current.write()? = None;
        event!(
            Level::INFO,
            map = %self.config.map_name,
            pending_orphans = ?self.orphans.len().ok(),
            "session store supervisor stopped"
        );
        Ok(())
    }

    fn ready_handle(&self) -> Result<Option<StoreHandle>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SessionError::ShutDown);
        }
        if !self.connected.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(self.current.read()?.clone())
    }

    fn check_rate_limit(&self) -> Result<()> {
        let last_attempt = *self.last_attempt.lock()?;
        if let Some(last_attempt) = last_attempt {
            let elapsed = last_attempt.elapsed();
            if elapsed < self.config.retry_interval {
                return Err(SessionError::unavailable(format_args!(
                    "store connection down; next attempt in {:?}",
                    self.config.retry_interval - elapsed
                )));
            }
        }
        Ok(())
    }

    async fn reconnect(&self) -> Result<StoreHandle> {
        *self.last_attempt.lock()? = Some(Instant::now());
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        event!(Level::INFO, attempt, "connecting to session store");

        let map = match timeout(self.config.connect_timeout, self.connector.connect(&self.config))
            .await
        {
            Ok(Ok(map)) => map,
            Ok(Err(err)) => return Err(self.connect_failed(err)),
            Err(_) => {
                return Err(self.connect_failed(SessionError::unavailable(format_args!(
                    "connect timed out after {:?}",
                    self.config.connect_timeout
                ))));
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = StoreHandle::new(map, self.config.operation_timeout, generation);

        if let Some(ttl) = self.config.session_ttl {
            // Some stores do not let clients change map config; sessions then
            // live until their owners release them.
            if let Err(err) = handle.set_time_to_live(Some(ttl)).await {
                event!(Level::INFO, error = %err, "could not apply session ttl to store map");
            }
        }

        *self.current.write()? = Some(handle.clone());
        self.connected.store(true, Ordering::Release);
        self.successes.fetch_add(1, Ordering::SeqCst);
        event!(
            Level::INFO,
            generation,
            map = %handle.map_name(),
            "connected to session store"
        );

        // A failing deletion stays queued for the probe; the caller still
        // gets the healthy handle.
        if let Err(err) = self.replay_orphans(&handle).await {
            event!(Level::WARN, error = %err, "orphans left queued after reconnect");
        }
        Ok(handle)
    }

    fn connect_failed(&self, err: SessionError) -> SessionError {
        self.connected.store(false, Ordering::Release);
        self.failures.fetch_add(1, Ordering::SeqCst);
        event!(Level::WARN, error = %err, "session store connection failed");
        err
    }

    /// Replays queued deletions on the current connection and returns how many
    /// reached the store. Stops at the first failure, leaving that entry and
    /// everything behind it queued; the connection is not marked failed.
    pub async fn drain_orphans(&self) -> Result<usize> {
        let handle = self.ensure_ready().await?;
        self.replay_orphans(&handle).await
    }

    /// Replays queued deletions oldest first, stopping at the first failure so
    /// the remaining ones keep their order for the next attempt.
    async fn replay_orphans(&self, handle: &StoreHandle) -> Result<usize> {
        let _guard = self.drain_lock.lock().await;
        let mut drained = 0;
        while let Some(orphan) = self.orphans.front()? {
            match handle.execute(&orphan.session_id, &orphan.operation()).await {
                Ok(_) => {
                    self.orphans.complete(&orphan)?;
                    drained += 1;
                    event!(
                        Level::DEBUG,
                        session_id = %orphan.session_id,
                        invalidate = orphan.invalidate,
                        "orphaned session deletion replayed"
                    );
                }
                Err(err) => {
                    event!(
                        Level::DEBUG,
                        session_id = %orphan.session_id,
                        drained,
                        error = %err,
                        "orphan drain interrupted"
                    );
                    return Err(err);
                }
            }
        }
        if drained > 0 {
            event!(Level::INFO, drained, "orphan queue drained");
        }
        Ok(drained)
    }
}

/// Background task probing the store at a fixed cadence so connectivity comes
/// back without live traffic.
struct ProbeWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl ProbeWorker {
    fn spawn(supervisor: &Arc<ConnectionSupervisor>) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let supervisor = Arc::downgrade(supervisor);

        let join_handle = tokio::spawn(async move {
            loop {
                let interval = match supervisor.upgrade() {
                    Some(supervisor) => supervisor.config.probe_interval,
                    None => break,
                };
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = sleep(interval) => {
                        let Some(supervisor) = supervisor.upgrade() else {
                            break;
                        };
                        if let Err(err) = supervisor.ensure_ready().await {
                            event!(Level::TRACE, error = %err, "session store probe failed");
                            continue;
                        }
                        if matches!(supervisor.orphans.is_empty(), Ok(false)) {
                            if let Err(err) = supervisor.drain_orphans().await {
                                event!(Level::TRACE, error = %err, "orphan retry failed");
                            }
                        }
                    }
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    /// Signals the task to stop and waits at most `wait` for it.
    async fn stop(mut self, wait: std::time::Duration) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(mut join_handle) = self.join_handle.take() {
            match timeout(wait, &mut join_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    event!(Level::WARN, error = %err, "session store probe task failed");
                }
                Err(_) => {
                    event!(Level::WARN, ?wait, "session store probe task did not stop in time");
                    join_handle.abort();
                }
            }
        }
    }
}

impl Drop for ProbeWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryCluster;
    use std::time::Duration;

    fn fast_config() -> StoreConfig {
        StoreConfig::new("sessions")
            .retry_interval(Duration::from_millis(100))
            .probe_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_connects_lazily_and_reuses_handle() {
        let cluster = InMemoryCluster::new();
        let connector = Arc::new(cluster.connector());
        let supervisor = ConnectionSupervisor::new(fast_config(), connector.clone()).unwrap();

        assert!(!supervisor.is_connected());
        let first = supervisor.ensure_ready().await.unwrap();
        let second = supervisor.ensure_ready().await.unwrap();
        assert_eq!(first.generation(), second.generation());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_failed_attempt_is_rate_limited() {
        let cluster = InMemoryCluster::new();
        cluster.set_available(false);
        let connector = Arc::new(cluster.connector());
        let supervisor = ConnectionSupervisor::new(fast_config(), connector.clone()).unwrap();

        assert!(supervisor.ensure_ready().await.is_err());
        cluster.set_available(true);
        // Inside the retry interval: no new attempt is made.
        let err = supervisor.ensure_ready().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(connector.attempts(), 1);

        sleep(Duration::from_millis(120)).await;
        assert!(supervisor.ensure_ready().await.is_ok());
        assert_eq!(connector.attempts(), 2);
        assert_eq!(supervisor.stats().unwrap().connect_failures, 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_attempt() {
        let cluster = InMemoryCluster::new();
        cluster.set_available(false);
        let connector = Arc::new(cluster.connector());
        let supervisor = ConnectionSupervisor::new(fast_config(), connector.clone()).unwrap();

        let calls = (0..8).map(|_| {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.ensure_ready().await })
        });
        for call in futures::future::join_all(calls).await {
            assert!(call.unwrap().is_err());
        }
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_mark_failed_forces_new_generation() {
        let cluster = InMemoryCluster::new();
        let supervisor =
            ConnectionSupervisor::new(fast_config(), Arc::new(cluster.connector())).unwrap();

        let first = supervisor.ensure_ready().await.unwrap();
        supervisor.mark_failed(&SessionError::StoreUnavailable("test".into()));
        assert!(!supervisor.is_connected());

        sleep(Duration::from_millis(120)).await;
        let second = supervisor.ensure_ready().await.unwrap();
        assert!(second.generation() > first.generation());
    }

    #[tokio::test]
    async fn test_probe_restores_connection_without_traffic() {
        let cluster = InMemoryCluster::new();
        cluster.set_available(false);
        let supervisor =
            ConnectionSupervisor::new(fast_config(), Arc::new(cluster.connector())).unwrap();
        supervisor.start().await.unwrap();
        assert!(!supervisor.is_connected());

        cluster.set_available(true);
        sleep(Duration::from_millis(300)).await;
        assert!(supervisor.is_connected());

        supervisor.shutdown().await.unwrap();
        assert!(matches!(
            supervisor.ensure_ready().await,
            Err(SessionError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_session_ttl_is_forwarded_on_connect() {
        let cluster = InMemoryCluster::new();
        let config = fast_config().session_ttl(Duration::from_millis(30));
        let supervisor = ConnectionSupervisor::new(config, Arc::new(cluster.connector())).unwrap();

        let handle = supervisor.ensure_ready().await.unwrap();
        handle
            .execute(
                "s1",
                &crate::operations::SessionOperation::UpdateAttributes {
                    owner_id: "p1".into(),
                    updates: Default::default(),
                },
            )
            .await
            .unwrap();
        sleep(Duration::from_millis(60)).await;
        assert_eq!(handle.size().await.unwrap(), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let cluster = InMemoryCluster::new();
        let result = ConnectionSupervisor::new(
            StoreConfig::new(""),
            Arc::new(cluster.connector()),
        );
        assert!(matches!(result, Err(SessionError::Config(_))));
    }
}

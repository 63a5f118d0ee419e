/// Local session cache tests
///
/// Write-through and deferred-write behaviour of clustered sessions,
/// including store outages.
/// Run with: cargo test --test local_cache_tests
use memsession::{
    ConnectionSupervisor, InMemoryCluster, OwnerId, SessionConfig, SessionManager,
    SessionReplicationClient, StoreConfig,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const RETRY: Duration = Duration::from_millis(50);

fn manager(cluster: &Arc<InMemoryCluster>, owner: &str, config: SessionConfig) -> SessionManager {
    let store = StoreConfig::new("sessions").retry_interval(RETRY);
    let supervisor = ConnectionSupervisor::new(store, Arc::new(cluster.connector())).unwrap();
    let client = SessionReplicationClient::with_default_codec(OwnerId::new(owner), supervisor);
    SessionManager::new(Arc::new(client), config)
}

async fn wait_for_retry_window() {
    tokio::time::sleep(RETRY + Duration::from_millis(30)).await;
}

#[tokio::test]
async fn test_write_through_is_visible_to_other_process() {
    let cluster = InMemoryCluster::new();
    let p1 = manager(&cluster, "P1", SessionConfig::write_through());
    let p2 = manager(&cluster, "P2", SessionConfig::write_through());

    let s1 = p1.attach("S1", true).await.unwrap();
    let s2 = p2.attach("S1", false).await.unwrap();

    s1.set_attribute("k", json!("v1")).await.unwrap();
    assert_eq!(s2.get_attribute("k").await.unwrap(), Some(json!("v1")));

    s2.set_attribute("k", json!("v2")).await.unwrap();
    assert_eq!(s1.get_attribute("k").await.unwrap(), Some(json!("v2")));

    s1.remove_attribute("k").await.unwrap();
    assert_eq!(s2.get_attribute("k").await.unwrap(), None);
    assert!(!s1.session_changed().unwrap());
}

#[tokio::test]
async fn test_write_through_failure_is_kept_and_resent() {
    let cluster = InMemoryCluster::new();
    let p1 = manager(&cluster, "P1", SessionConfig::write_through());
    let p2 = manager(&cluster, "P2", SessionConfig::write_through());
    let s1 = p1.attach("S1", true).await.unwrap();
    s1.set_attribute("k", json!("v1")).await.unwrap();

    cluster.set_available(false);
    let err = s1.set_attribute("k", json!("v2")).await.unwrap_err();
    assert!(err.is_retryable());
    // The pending local write shadows the store and survives the outage.
    assert_eq!(s1.get_attribute("k").await.unwrap(), Some(json!("v2")));
    assert!(s1.needs_flush().unwrap());

    cluster.set_available(true);
    wait_for_retry_window().await;
    assert!(p1.complete_request(&s1).await);

    let s2 = p2.attach("S1", false).await.unwrap();
    assert_eq!(s2.get_attribute("k").await.unwrap(), Some(json!("v2")));
}

#[tokio::test]
async fn test_write_through_read_falls_back_to_last_known_value() {
    let cluster = InMemoryCluster::new();
    let p1 = manager(&cluster, "P1", SessionConfig::write_through());
    let s1 = p1.attach("S1", true).await.unwrap();
    s1.set_attribute("k", json!(7)).await.unwrap();
    assert_eq!(s1.get_attribute("k").await.unwrap(), Some(json!(7)));

    cluster.set_available(false);
    assert_eq!(s1.get_attribute("k").await.unwrap(), Some(json!(7)));
    assert_eq!(s1.get_attribute("never").await.unwrap(), None);
    assert!(s1.attribute_names().await.unwrap().contains("k"));
}

#[tokio::test]
async fn test_deferred_reads_and_writes_stay_local() {
    let cluster = InMemoryCluster::new();
    let p1 = manager(&cluster, "P1", SessionConfig::deferred());
    let map = cluster.map("sessions").unwrap();

    let session = p1.attach("S1", true).await.unwrap();
    session.set_attribute("a", json!(1)).await.unwrap();
    session.set_attribute("b", json!(2)).await.unwrap();
    assert_eq!(session.get_attribute("a").await.unwrap(), Some(json!(1)));
    assert_eq!(map.operations_executed(), 0);

    assert!(session.session_changed().unwrap());
    assert!(p1.complete_request(&session).await);
    assert_eq!(map.operations_executed(), 1);

    let state = map.peek("S1").await.unwrap();
    assert_eq!(state.attributes.len(), 2);
    assert!(!session.session_changed().unwrap());
}

#[tokio::test]
async fn test_deferred_attach_loads_existing_attributes() {
    let cluster = InMemoryCluster::new();
    let p1 = manager(&cluster, "P1", SessionConfig::write_through());
    let p2 = manager(&cluster, "P2", SessionConfig::deferred());

    let s1 = p1.attach("S1", true).await.unwrap();
    s1.set_attribute("user", json!("ada")).await.unwrap();
    s1.set_attribute("cart", json!([1, 2])).await.unwrap();

    let s2 = p2.attach("S1", false).await.unwrap();
    assert!(!s2.is_new());
    assert_eq!(s2.get_attribute("cart").await.unwrap(), Some(json!([1, 2])));
    let names: Vec<String> = s2.attribute_names().await.unwrap().into_iter().collect();
    assert_eq!(names, vec!["cart".to_string(), "user".to_string()]);
}

#[tokio::test]
async fn test_deferred_session_survives_outage() {
    let cluster = InMemoryCluster::new();
    let p1 = manager(&cluster, "P1", SessionConfig::deferred());
    let session = p1.attach("S1", true).await.unwrap();
    session.set_attribute("seed", json!("s")).await.unwrap();
    assert!(p1.complete_request(&session).await);

    cluster.set_available(false);
    for i in 0..3 {
        session.set_attribute(&format!("attr{}", i), json!(i)).await.unwrap();
    }
    assert!(!p1.complete_request(&session).await);
    for i in 0..3 {
        let entry = session.local_entry(&format!("attr{}", i)).unwrap().unwrap();
        assert!(entry.is_dirty());
    }

    session.mark_all_for_reload().unwrap();
    assert_eq!(session.get_attribute("uncached").await.unwrap(), None);
    assert_eq!(session.get_attribute("attr1").await.unwrap(), Some(json!(1)));
    assert_eq!(session.get_attribute("seed").await.unwrap(), Some(json!("s")));

    cluster.set_available(true);
    wait_for_retry_window().await;
    session.set_attribute("attr3", json!(3)).await.unwrap();
    assert!(p1.complete_request(&session).await);

    let state = cluster.map("sessions").unwrap().peek("S1").await.unwrap();
    let names: Vec<&str> = state.attributes.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["attr0", "attr1", "attr2", "attr3", "seed"]);
}

#[tokio::test]
async fn test_failed_flush_marks_nothing_clean() {
    let cluster = InMemoryCluster::new();
    let p1 = manager(&cluster, "P1", SessionConfig::deferred());
    let session = p1.attach("S1", true).await.unwrap();
    session.set_attribute("a", json!(1)).await.unwrap();
    session.set_attribute("b", json!(2)).await.unwrap();
    session.remove_attribute("b").await.unwrap();

    cluster.set_available(false);
    assert!(session.flush().await.is_err());
    assert!(session.is_new());
    assert!(session.local_entry("a").unwrap().unwrap().is_dirty());
    let removed = session.local_entry("b").unwrap().unwrap();
    assert!(removed.is_dirty() && removed.is_removed());

    cluster.set_available(true);
    wait_for_retry_window().await;
    assert!(session.flush().await.unwrap());
    assert!(!session.local_entry("a").unwrap().unwrap().is_dirty());
    assert!(session.local_entry("b").unwrap().is_none());
    assert!(!session.is_new());
}

#[tokio::test]
async fn test_transient_attributes_stay_in_process() {
    let cluster = InMemoryCluster::new();
    let config = SessionConfig::deferred().transient("csrf");
    let p1 = manager(&cluster, "P1", config);
    let session = p1.attach("S1", true).await.unwrap();

    session.set_attribute("csrf", json!("token")).await.unwrap();
    session.set_attribute("user", json!("ada")).await.unwrap();
    assert!(p1.complete_request(&session).await);

    assert_eq!(session.get_attribute("csrf").await.unwrap(), Some(json!("token")));
    let state = cluster.map("sessions").unwrap().peek("S1").await.unwrap();
    assert!(state.attributes.contains_key("user"));
    assert!(!state.attributes.contains_key("csrf"));
    assert!(!session.session_changed().unwrap());
}

#[tokio::test]
async fn test_mark_reload_picks_up_remote_change() {
    let cluster = InMemoryCluster::new();
    let writer = manager(&cluster, "P1", SessionConfig::write_through());
    let reader = manager(&cluster, "P2", SessionConfig::deferred());

    let w = writer.attach("S1", true).await.unwrap();
    w.set_attribute("k", json!("old")).await.unwrap();
    let r = reader.attach("S1", false).await.unwrap();
    w.set_attribute("k", json!("new")).await.unwrap();

    assert_eq!(r.get_attribute("k").await.unwrap(), Some(json!("old")));
    assert!(r.mark_reload("k").unwrap());
    assert_eq!(r.get_attribute("k").await.unwrap(), Some(json!("new")));
    assert!(!r.mark_reload("missing").unwrap());
}

#[tokio::test]
async fn test_concurrent_writers_share_one_flush() {
    let cluster = InMemoryCluster::new();
    let p1 = manager(&cluster, "P1", SessionConfig::deferred());
    let session = p1.attach("S1", true).await.unwrap();

    let writers = (0..16).map(|i| {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            session
                .set_attribute(&format!("k{}", i), json!(i))
                .await
                .unwrap();
        })
    });
    for writer in futures::future::join_all(writers).await {
        writer.unwrap();
    }

    assert!(p1.complete_request(&session).await);
    let state = cluster.map("sessions").unwrap().peek("S1").await.unwrap();
    assert_eq!(state.attributes.len(), 16);
}

#[tokio::test]
async fn test_release_and_invalidate_through_manager() {
    let cluster = InMemoryCluster::new();
    let p1 = manager(&cluster, "P1", SessionConfig::deferred());
    let p2 = manager(&cluster, "P2", SessionConfig::deferred());
    let map = cluster.map("sessions").unwrap();

    let s1 = p1.attach("S1", true).await.unwrap();
    s1.set_attribute("k", json!(1)).await.unwrap();
    p1.complete_request(&s1).await;
    p2.attach("S1", false).await.unwrap();

    assert!(p1.release("S1").await);
    assert!(map.peek("S1").await.is_some());

    assert!(p2.invalidate("S1").await);
    assert!(map.peek("S1").await.is_none());
    assert!(p2.live_sessions().unwrap().is_empty());
}

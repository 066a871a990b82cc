//! Persistence integration tests.
//!
//! Verifies:
//! - Queued writes survive closing and reopening the RocksDB store
//! - Ids keep increasing across reopen, so FIFO order holds
//! - An engine restarted on the same path restores the session and
//!   pushes what the previous run queued
//! - An edit still waiting on the debounce at shutdown is not lost
//! - An unopenable store falls back to memory and reports it

use folio_sync::{
    ConnectivityMonitor, DurableWriteQueue, IdentityKind, RocksStore, Settings, Storage,
    StoreConfig, SyncConfig, SyncEngine, SyncStatus,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::time::{sleep, timeout, Duration};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config_at(db: &std::path::Path, base_url: &str) -> SyncConfig {
    SyncConfig {
        storage_path: Some(db.to_path_buf()),
        debounce: Duration::from_millis(150),
        ..SyncConfig::for_testing().with_remote(base_url, None)
    }
}

async fn backend(push_status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/magic-link"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/projects"))
        .respond_with(ResponseTemplate::new(push_status))
        .mount(&server)
        .await;
    server
}

async fn push_bodies(server: &MockServer) -> Vec<serde_json::Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/api/projects")
        .map(|r| r.body_json::<serde_json::Value>().unwrap()["data"].clone())
        .collect()
}

// ─── Queue ───────────────────────────────────────────────────────────

#[test]
fn test_queue_survives_reopen_in_order() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("db");

    let first_ids: Vec<u64> = {
        let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&db)).unwrap());
        let queue = DurableWriteQueue::new(store);
        assert!(!queue.is_degraded());
        (1..=3)
            .map(|n| queue.enqueue(format!("snapshot-{n}").into_bytes()).unwrap().id)
            .collect()
    };

    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&db)).unwrap());
    let queue = DurableWriteQueue::new(store);
    assert_eq!(queue.len().unwrap(), 3);

    let later = queue.enqueue(b"snapshot-4".to_vec()).unwrap();
    assert!(later.id > *first_ids.iter().max().unwrap());

    let payloads: Vec<Vec<u8>> = queue.drain().unwrap().into_iter().map(|w| w.payload).collect();
    assert_eq!(
        payloads,
        vec![
            b"snapshot-1".to_vec(),
            b"snapshot-2".to_vec(),
            b"snapshot-3".to_vec(),
            b"snapshot-4".to_vec(),
        ]
    );
    assert!(queue.is_empty().unwrap());
}

#[test]
fn test_requeued_writes_keep_position_after_reopen() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("db");

    {
        let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&db)).unwrap());
        let queue = DurableWriteQueue::new(store);
        for n in 1..=3 {
            queue.enqueue(vec![n]).unwrap();
        }
        let drained = queue.drain().unwrap();
        // First one delivered, the rest go back
        queue.requeue(drained.into_iter().skip(1).collect()).unwrap();
        queue.enqueue(vec![4]).unwrap();
    }

    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&db)).unwrap());
    let queue = DurableWriteQueue::new(store);
    let payloads: Vec<Vec<u8>> = queue.drain().unwrap().into_iter().map(|w| w.payload).collect();
    assert_eq!(payloads, vec![vec![2], vec![3], vec![4]]);
}

#[test]
fn test_unopenable_store_falls_back_to_memory() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file in the way").unwrap();

    let storage = Storage::open(Some(StoreConfig::for_testing(blocker.join("db"))));
    assert!(!storage.is_durable());

    let queue = DurableWriteQueue::new(storage.queue);
    queue.enqueue(b"kept in memory".to_vec()).unwrap();
    assert!(queue.is_degraded());
    assert_eq!(queue.len().unwrap(), 1);
}

// ─── Engine restart ──────────────────────────────────────────────────

#[tokio::test]
async fn test_restart_restores_session_and_flushes_queue() {
    init_logging();
    let dir = tempdir().unwrap();
    let db = dir.path().join("db");
    let server = backend(200).await;

    {
        let engine = SyncEngine::builder(config_at(&db, &server.uri()))
            .connectivity(ConnectivityMonitor::new(false))
            .start()
            .await
            .unwrap();
        assert!(!engine.is_degraded());
        engine.request_authentication("writer@example.com").await.unwrap();

        engine.notify_edit(json!({ "rev": 1 }).to_string().into_bytes()).await.unwrap();
        sleep(Duration::from_millis(300)).await;
        engine.notify_edit(json!({ "rev": 2 }).to_string().into_bytes()).await.unwrap();
        sleep(Duration::from_millis(300)).await;
        assert_eq!(engine.queue_len(), 2);
        engine.shutdown().await;
    }
    assert!(push_bodies(&server).await.is_empty());

    let engine = SyncEngine::builder(config_at(&db, &server.uri()))
        .start()
        .await
        .unwrap();
    let identity = engine.identity().expect("session restored");
    assert_eq!(identity.kind, IdentityKind::Authenticated);
    assert_eq!(identity.email, "writer@example.com");

    let bodies = timeout(Duration::from_secs(5), async {
        loop {
            let bodies = push_bodies(&server).await;
            if bodies.len() >= 2 {
                return bodies;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(bodies, vec![json!({ "rev": 1 }), json!({ "rev": 2 })]);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.queue_len(), 0);
    assert_eq!(engine.status(), SyncStatus::Synced);
    let synced_at = engine.last_synced_at().unwrap();
    engine.shutdown().await;

    // Last sync time is persisted too
    let store = RocksStore::open(StoreConfig::for_testing(&db)).unwrap();
    let settings = Settings::load(&store).unwrap();
    assert_eq!(settings.last_synced_at, Some(synced_at));
}

#[tokio::test]
async fn test_shutdown_keeps_debounced_edit() {
    init_logging();
    let dir = tempdir().unwrap();
    let db = dir.path().join("db");
    let server = backend(200).await;

    {
        let config = SyncConfig {
            debounce: Duration::from_secs(60),
            ..config_at(&db, &server.uri())
        };
        let engine = SyncEngine::builder(config).start().await.unwrap();
        engine.request_authentication("writer@example.com").await.unwrap();
        engine.notify_edit(b"unsaved".to_vec()).await.unwrap();
        engine.shutdown().await;
    }
    assert!(push_bodies(&server).await.is_empty());

    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&db)).unwrap());
    let queue = DurableWriteQueue::new(store);
    let writes = queue.drain().unwrap();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].payload, b"unsaved".to_vec());
}

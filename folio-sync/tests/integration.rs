//! End-to-end sync tests against a mock HTTP backend.
//!
//! Each test runs one or more engines against a `wiremock` server and
//! checks what actually went over the wire:
//! - Debounced edits produce one push with the latest snapshot
//! - Offline edits are queued and pushed once connectivity returns
//! - Magic-link failures: unreachable falls back to a demo session,
//!   rejection is an error
//! - A host wake-up makes another instance flush the shared queue in order

use folio_sync::wake::FLUSH_TASK_NAME;
use folio_sync::{
    ConnectivityMonitor, IdentityKind, Storage, SyncConfig, SyncEngine, SyncStatus, WakeHub,
};
use serde_json::json;
use tokio::time::{sleep, timeout, Duration};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Find a port nothing is listening on.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn config_for(base_url: &str) -> SyncConfig {
    SyncConfig {
        debounce: Duration::from_millis(200),
        ..SyncConfig::for_testing().with_remote(base_url, Some("secret-key".into()))
    }
}

async fn mock_backend() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/magic-link"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

/// Bodies of every push the backend has received, in arrival order.
async fn pushed(server: &MockServer) -> Vec<serde_json::Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/api/projects")
        .map(|r| r.body_json::<serde_json::Value>().unwrap()["data"].clone())
        .collect()
}

async fn wait_for_pushes(server: &MockServer, count: usize) -> Vec<serde_json::Value> {
    timeout(Duration::from_secs(5), async {
        loop {
            let bodies = pushed(server).await;
            if bodies.len() >= count {
                return bodies;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("backend never received the expected pushes")
}

fn edit(rev: u32) -> Vec<u8> {
    json!({ "title": "Chapter One", "rev": rev }).to_string().into_bytes()
}

// ─── Push ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_debounced_edits_push_latest_snapshot() {
    init_logging();
    let server = mock_backend().await;
    Mock::given(method("POST"))
        .and(path("/api/projects"))
        .and(header("authorization", "Bearer secret-key"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let engine = SyncEngine::builder(config_for(&server.uri()))
        .start()
        .await
        .unwrap();
    let identity = engine.request_authentication("Writer@Example.com").await.unwrap();
    assert_eq!(identity.kind, IdentityKind::Authenticated);
    assert_eq!(identity.email, "writer@example.com");

    for rev in 1..=3 {
        engine.notify_edit(edit(rev)).await.unwrap();
        sleep(Duration::from_millis(50)).await;
    }

    let bodies = wait_for_pushes(&server, 1).await;
    assert_eq!(bodies, vec![json!({ "title": "Chapter One", "rev": 3 })]);

    let request = &server.received_requests().await.unwrap_or_default();
    let push = request.iter().find(|r| r.url.path() == "/api/projects").unwrap();
    let body: serde_json::Value = push.body_json().unwrap();
    assert_eq!(body["userId"], json!(identity.user_id));
    assert!(body["updatedAt"].is_string());

    sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.status(), SyncStatus::Synced);
    assert!(engine.last_synced_at().is_some());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_offline_edits_push_once_when_back_online() {
    init_logging();
    let server = mock_backend().await;
    Mock::given(method("POST"))
        .and(path("/api/projects"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let engine = SyncEngine::builder(config_for(&server.uri()))
        .connectivity(ConnectivityMonitor::new(false))
        .start()
        .await
        .unwrap();
    engine.request_authentication("writer@example.com").await.unwrap();
    assert_eq!(engine.status(), SyncStatus::Offline);

    // Three edits 100ms apart settle into one queued snapshot
    for rev in 1..=3 {
        engine.notify_edit(edit(rev)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
    }
    sleep(Duration::from_millis(400)).await;
    assert_eq!(engine.queue_len(), 1);
    assert!(pushed(&server).await.is_empty());

    engine.connectivity().report(true);
    let bodies = wait_for_pushes(&server, 1).await;
    assert_eq!(bodies, vec![json!({ "title": "Chapter One", "rev": 3 })]);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.queue_len(), 0);
    assert_eq!(engine.status(), SyncStatus::Synced);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_rejected_push_reports_error_and_keeps_write() {
    init_logging();
    let server = mock_backend().await;
    Mock::given(method("POST"))
        .and(path("/api/projects"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let engine = SyncEngine::builder(config_for(&server.uri()))
        .start()
        .await
        .unwrap();
    engine.request_authentication("writer@example.com").await.unwrap();

    let mut status = engine.subscribe_status();
    engine.notify_edit(edit(1)).await.unwrap();
    timeout(Duration::from_secs(5), status.wait_for(|s| *s == SyncStatus::Error))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(engine.queue_len(), 1);
    assert!(engine.last_synced_at().is_none());
    engine.shutdown().await;
}

// ─── Magic link ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_unreachable_magic_link_starts_demo_session() {
    init_logging();
    let port = free_port().await;
    let engine = SyncEngine::builder(config_for(&format!("http://127.0.0.1:{port}")))
        .start()
        .await
        .unwrap();

    let identity = engine.request_authentication("writer@example.com").await.unwrap();
    assert_eq!(identity.kind, IdentityKind::Demo);
    assert_eq!(identity.email, "writer@example.com");
    assert_eq!(engine.status(), SyncStatus::Local);

    // A demo session never pushes or queues
    engine.notify_edit(edit(1)).await.unwrap();
    sleep(Duration::from_millis(400)).await;
    assert_eq!(engine.queue_len(), 0);
    assert_eq!(engine.status(), SyncStatus::Local);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_rejected_magic_link_is_an_error() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/magic-link"))
        .and(body_json(json!({ "email": "writer@example.com" })))
        .respond_with(ResponseTemplate::new(422))
        .expect(1)
        .mount(&server)
        .await;

    let engine = SyncEngine::builder(config_for(&server.uri()))
        .start()
        .await
        .unwrap();
    let err = engine
        .request_authentication("writer@example.com")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("422"), "unexpected error: {err}");
    assert!(engine.identity().is_none());
    assert_eq!(engine.status(), SyncStatus::Local);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_invalid_email_rejected_before_network() {
    init_logging();
    let server = MockServer::start().await;
    let engine = SyncEngine::builder(config_for(&server.uri()))
        .start()
        .await
        .unwrap();

    assert!(engine.request_authentication("not-an-email").await.is_err());
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_sign_out_stops_pushing() {
    init_logging();
    let server = mock_backend().await;
    Mock::given(method("POST"))
        .and(path("/api/projects"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let engine = SyncEngine::builder(config_for(&server.uri()))
        .start()
        .await
        .unwrap();
    engine.request_authentication("writer@example.com").await.unwrap();
    assert_eq!(engine.status(), SyncStatus::Synced);

    engine.sign_out().await;
    assert!(engine.identity().is_none());
    assert_eq!(engine.status(), SyncStatus::Local);

    engine.notify_edit(edit(1)).await.unwrap();
    sleep(Duration::from_millis(400)).await;
    assert_eq!(engine.queue_len(), 0);
    engine.shutdown().await;
}

// ─── Background wake ─────────────────────────────────────────────────

#[tokio::test]
async fn test_host_wake_flushes_shared_queue_in_order() {
    init_logging();
    let server = mock_backend().await;
    Mock::given(method("POST"))
        .and(path("/api/projects"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&server)
        .await;

    let hub = WakeHub::new(16);
    let storage = Storage::in_memory();

    // The writer is offline; the background instance is online
    let writer = SyncEngine::builder(config_for(&server.uri()))
        .storage(storage.clone())
        .host(hub.clone())
        .connectivity(ConnectivityMonitor::new(false))
        .start()
        .await
        .unwrap();
    writer.request_authentication("writer@example.com").await.unwrap();

    let background = SyncEngine::builder(config_for(&server.uri()))
        .storage(storage)
        .host(hub.clone())
        .start()
        .await
        .unwrap();
    background.request_authentication("writer@example.com").await.unwrap();

    for rev in 1..=3 {
        writer.notify_edit(edit(rev)).await.unwrap();
        sleep(Duration::from_millis(350)).await;
    }
    assert_eq!(writer.queue_len(), 3);
    assert!(hub.is_registered(FLUSH_TASK_NAME));
    assert!(pushed(&server).await.is_empty());

    assert_eq!(hub.fire(FLUSH_TASK_NAME), 2);
    assert!(!hub.is_registered(FLUSH_TASK_NAME));

    let bodies = wait_for_pushes(&server, 3).await;
    let revs: Vec<_> = bodies.iter().map(|b| b["rev"].clone()).collect();
    assert_eq!(revs, vec![json!(1), json!(2), json!(3)]);
    assert_eq!(background.queue_len(), 0);

    writer.shutdown().await;
    background.shutdown().await;
}

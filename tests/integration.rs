//! Integration Tests for Facility Sync
//!
//! End-to-end flows over the in-memory collaborators: a [`SyncServer`]
//! wired to an [`InMemoryRecordStore`], an [`InMemoryClientStore`] and a
//! [`LocalBus`]. No external services needed.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//!
//! # Only the run-loop tests
//! cargo test --test integration run_loop
//! ```
//!
//! # Test Organization
//! - `happy_*` - Normal operation: delivery, partial sync, merge
//! - `gate_*` - Authentication and direction rules
//! - `run_loop_*` - Event loop: change feed, subscribe triggers, config, shutdown

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};

use facility_sync::storage::{InMemoryClientStore, InMemoryRecordStore};
use facility_sync::{
    ChangeAction, Client, Credentials, Facility, LocalBus, LogicalClock, Message, OutboundMessage, Record,
    RecordStore, SchemaPolicy, SchemaRegistry, ServerState, SyncMode, SyncOutcome, SyncServer,
    SyncServerConfig, WriteScope, AUTH_FAILED,
};

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    server: Arc<SyncServer>,
    store: Arc<InMemoryRecordStore>,
    bus: Arc<LocalBus>,
    config_tx: watch::Sender<SyncServerConfig>,
}

fn schemas() -> SchemaRegistry {
    SchemaRegistry::builder()
        .register(SchemaPolicy::new("patient").with_selectors(["displayId", "firstName"]))
        .register(SchemaPolicy::new("visit").with_filter(|ctx| {
            ctx.record
                .and_then(|r| r.get("hospitalId"))
                .and_then(Value::as_str)
                .map_or(true, |h| Some(h) == ctx.client.hospital_id.as_deref())
        }))
        .register(SchemaPolicy::new("report").with_sync(SyncMode::RemoteToLocal))
        .register(SchemaPolicy::new("audit").with_sync(SyncMode::LocalToRemote))
        .build()
}

fn harness_with(config: SyncServerConfig, clock_start: i64) -> Harness {
    let (config_tx, config_rx) = watch::channel(config.clone());
    let store = Arc::new(InMemoryRecordStore::with_clock(LogicalClock::manual(clock_start), 256));
    let bus = Arc::new(LocalBus::new());
    let server = Arc::new(SyncServer::new(
        config,
        config_rx,
        store.clone(),
        Arc::new(InMemoryClientStore::new()),
        schemas(),
        bus.clone(),
    ));
    Harness {
        server,
        store,
        bus,
        config_tx,
    }
}

fn harness() -> Harness {
    harness_with(SyncServerConfig::default(), 1000)
}

async fn client_at(h: &Harness, hospital: Option<&str>, sync_out: i64) -> Credentials {
    let mut client = Client::issue(hospital.map(String::from), None);
    client.sync_out = sync_out;
    let creds = client.credentials();
    h.server.clients().insert(client).await.unwrap();
    creds
}

fn sync_in(h: &Harness, creds: &Credentials, data: Value) -> Message {
    Message::new(h.server.sync_in_channel())
        .with_data(data)
        .with_credentials(creds)
}

fn drain(rx: &mut broadcast::Receiver<Value>) -> Vec<OutboundMessage> {
    let mut out = Vec::new();
    while let Ok(value) = rx.try_recv() {
        out.push(serde_json::from_value(value).unwrap());
    }
    out
}

async fn recv(rx: &mut broadcast::Receiver<Value>) -> OutboundMessage {
    let value = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an outbound message")
        .unwrap();
    serde_json::from_value(value).unwrap()
}

async fn wait_for_state(server: &SyncServer, state: ServerState) {
    for _ in 0..200 {
        if server.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("server never reached {}", state);
}

fn spawn_run(h: &Harness) -> tokio::task::JoinHandle<()> {
    let server = h.server.clone();
    tokio::spawn(async move { server.run().await })
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn happy_two_changes_past_watermark_are_delivered() {
    let h = harness();

    // P2 exists before the client's watermark
    let mut scope = h.store.begin_write().await.unwrap();
    scope.create("patient", Record::new("P2"), true).await.unwrap();
    scope.commit().await.unwrap();

    let creds = client_at(&h, None, 1000).await;
    let mut inbox = h.bus.subscribe(&format!("/out/{}", creds.client_id));

    h.server
        .save_local("patient", Record::new("P1").with_field("displayId", json!("ONE")))
        .await
        .unwrap();
    h.server.remove_local("patient", "P2").await.unwrap();

    let outcome = h.server.sync_client(&creds.client_id).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Delivered {
            published: 2,
            skipped: 0,
            watermark: 1002
        }
    );

    let mut messages = drain(&mut inbox);
    messages.sort_by_key(|m| m.timestamp);
    assert_eq!(messages.len(), 2);

    assert_eq!(messages[0].action, ChangeAction::Save);
    assert_eq!(messages[0].record_id, "P1");
    assert_eq!(messages[0].timestamp, 1001);
    assert_eq!(messages[0].record.as_ref().unwrap()["displayId"], "ONE");

    assert_eq!(messages[1].action, ChangeAction::Remove);
    assert_eq!(messages[1].record_id, "P2");
    assert_eq!(messages[1].timestamp, 1002);
    assert!(messages[1].record.is_none());

    let stored = h.server.clients().get(&creds.client_id).await.unwrap().unwrap();
    assert_eq!(stored.sync_out, 1002);

    // Nothing new: stays idle, watermark unchanged
    assert_eq!(h.server.sync_client(&creds.client_id).await.unwrap(), SyncOutcome::UpToDate);
    assert!(drain(&mut inbox).is_empty());
}

#[tokio::test]
async fn happy_selective_field_visibility() {
    let h = harness();
    let facility = Facility::new("h1").with_fully_synced("patient", "full");
    h.server.save_local("hospital", facility.to_record()).await.unwrap();

    let creds = client_at(&h, Some("h1"), 0).await;
    let mut inbox = h.bus.subscribe(&h.server.out_channel(&creds.client_id));

    for id in ["partial", "full"] {
        let mut record = Record::new(id)
            .with_field("displayId", json!("ABC123"))
            .with_field("createdBy", json!("nurse-1"))
            .with_field("diagnosis", json!("confidential"));
        record.set("firstName", json!("Ada"), 5);
        record.set("diagnosis", json!("confidential"), 6);
        h.server.save_local("patient", record).await.unwrap();
    }

    h.server.sync_client(&creds.client_id).await.unwrap();
    let messages = drain(&mut inbox);
    let record_of = |id: &str| {
        messages
            .iter()
            .find(|m| m.record_id == id)
            .and_then(|m| m.record.clone())
            .unwrap()
    };

    assert_eq!(
        record_of("partial"),
        json!({
            "_id": "partial",
            "displayId": "ABC123",
            "firstName": "Ada",
            "createdBy": "nurse-1",
            "modifiedFields": {"firstName": 5},
            "fullySynced": false
        })
    );

    let full = record_of("full");
    assert_eq!(full["diagnosis"], "confidential");
    assert_eq!(full["fullySynced"], true);
    assert_eq!(full["modifiedFields"], json!({"firstName": 5, "diagnosis": 6}));
}

#[tokio::test]
async fn happy_filter_excludes_but_watermark_advances() {
    let h = harness();
    let creds = client_at(&h, Some("h1"), 1000).await;
    let mut inbox = h.bus.subscribe(&h.server.out_channel(&creds.client_id));

    h.server
        .save_local("visit", Record::new("v-other").with_field("hospitalId", json!("h2")))
        .await
        .unwrap();

    let outcome = h.server.sync_client(&creds.client_id).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Delivered {
            published: 0,
            skipped: 1,
            watermark: 1001
        }
    );
    assert!(drain(&mut inbox).is_empty());
    assert_eq!(h.server.clients().get(&creds.client_id).await.unwrap().unwrap().sync_out, 1001);
}

#[tokio::test]
async fn happy_field_merge_through_the_server() {
    let h = harness();
    let creds = h.server.register_client(Some("h1".into()), None).await.unwrap();

    let first = json!({
        "action": "SAVE", "recordType": "patient",
        "record": {"_id": "p1", "a": "server-a", "b": "server-b", "modifiedFields": {"a": 10, "b": 5}}
    });
    let second = json!({
        "action": "save", "recordType": "patient",
        "record": {"_id": "p1", "a": "client-a", "b": "client-b", "modifiedFields": {"a": 7, "b": 8}}
    });
    assert!(h.server.receive(sync_in(&h, &creds, first)).await.error.is_none());
    assert!(h.server.receive(sync_in(&h, &creds, second)).await.error.is_none());

    let stored = h.store.find_one("patient", "p1").await.unwrap().unwrap();
    assert_eq!(stored.get("a"), Some(&json!("server-a")));
    assert_eq!(stored.get("b"), Some(&json!("client-b")));
    assert_eq!(stored.modified_fields.get("a"), Some(10));
    assert_eq!(stored.modified_fields.get("b"), Some(8));
}

#[tokio::test]
async fn happy_redelivery_is_idempotent() {
    let h = harness();
    let creds = h.server.register_client(None, None).await.unwrap();
    let payload = json!({
        "action": "SAVE", "recordType": "patient",
        "record": {"_id": "p1", "firstName": "Ada", "modifiedFields": {"firstName": 42}}
    });

    h.server.receive(sync_in(&h, &creds, payload.clone())).await;
    let after_first = h.store.find_one("patient", "p1").await.unwrap();
    let changes_after_first = h.store.change_count().await;

    let reply = h.server.receive(sync_in(&h, &creds, payload)).await;
    assert!(reply.error.is_none());
    assert_eq!(h.store.find_one("patient", "p1").await.unwrap(), after_first);
    assert_eq!(h.store.change_count().await, changes_after_first);
}

#[tokio::test]
async fn happy_remove_and_wipe() {
    let h = harness();
    let creds = h.server.register_client(None, None).await.unwrap();
    h.server.save_local("patient", Record::new("p1")).await.unwrap();

    let reply = h
        .server
        .receive(sync_in(&h, &creds, json!({"action": "REMOVE", "recordType": "patient", "recordId": "p1"})))
        .await;
    assert!(reply.error.is_none());
    assert!(h.store.find_one("patient", "p1").await.unwrap().is_none());

    let reply = h
        .server
        .receive(sync_in(&h, &creds, json!({"action": "WIPE", "recordType": "patient", "recordId": "p1"})))
        .await;
    assert_eq!(reply.error.as_deref(), Some("sync action 'wipe' is not supported"));
}

// =============================================================================
// Gates
// =============================================================================

#[tokio::test]
async fn gate_bad_credentials_never_reach_the_store() {
    let h = harness();
    let creds = h.server.register_client(None, None).await.unwrap();
    let forged = Credentials {
        client_id: creds.client_id.clone(),
        client_secret: "forged".into(),
    };

    let reply = h
        .server
        .receive(sync_in(
            &h,
            &forged,
            json!({"action": "SAVE", "recordType": "patient", "record": {"_id": "p1"}}),
        ))
        .await;

    assert_eq!(reply.error.as_deref(), Some(AUTH_FAILED));
    assert!(reply.client.is_none());
    assert_eq!(h.store.len("patient").await, 0);
    assert_eq!(h.store.change_count().await, 0);
}

#[tokio::test]
async fn gate_expired_credentials_fail() {
    let h = harness_with(
        SyncServerConfig {
            client_ttl_secs: Some(0),
            ..Default::default()
        },
        0,
    );
    let creds = h.server.register_client(None, None).await.unwrap();

    let reply = h
        .server
        .receive(Message::new("/meta/subscribe").with_credentials(&creds))
        .await;
    assert_eq!(reply.error.as_deref(), Some(AUTH_FAILED));
}

#[tokio::test]
async fn gate_direction_rules_per_mode() {
    let h = harness();
    let creds = client_at(&h, None, 0).await;
    let mut inbox = h.bus.subscribe(&h.server.out_channel(&creds.client_id));

    // report: server → client only
    let reply = h
        .server
        .receive(sync_in(&h, &creds, json!({"action": "SAVE", "recordType": "report", "record": {"_id": "r1"}})))
        .await;
    assert!(reply.error.is_some());

    // audit: client → server only
    let reply = h
        .server
        .receive(sync_in(&h, &creds, json!({"action": "SAVE", "recordType": "audit", "record": {"_id": "a1"}})))
        .await;
    assert!(reply.error.is_none());

    h.server.save_local("report", Record::new("r1")).await.unwrap();
    h.server.sync_client(&creds.client_id).await.unwrap();

    let delivered: Vec<_> = drain(&mut inbox).into_iter().map(|m| m.record_type).collect();
    assert_eq!(delivered, vec!["report".to_string()]);
}

// =============================================================================
// Run loop
// =============================================================================

#[tokio::test]
async fn run_loop_change_feed_fans_out_to_other_clients() {
    let h = harness_with(
        SyncServerConfig {
            sweep_interval_ms: 60_000,
            ..Default::default()
        },
        1000,
    );
    let writer = h.server.register_client(Some("h1".into()), None).await.unwrap();
    let reader = h.server.register_client(Some("h1".into()), None).await.unwrap();
    let mut reader_inbox = h.bus.subscribe(&h.server.out_channel(&reader.client_id));

    let handle = spawn_run(&h);
    wait_for_state(&h.server, ServerState::Running).await;

    let reply = h
        .server
        .receive(sync_in(
            &h,
            &writer,
            json!({"action": "SAVE", "recordType": "patient", "record": {"_id": "p1", "displayId": "X"}}),
        ))
        .await;
    assert!(reply.error.is_none());

    let message = recv(&mut reader_inbox).await;
    assert_eq!(message.record_id, "p1");
    assert_eq!(message.action, ChangeAction::Save);

    h.server.shutdown().await;
    handle.await.unwrap();
    assert_eq!(h.server.state(), ServerState::ShuttingDown);
}

#[tokio::test]
async fn run_loop_subscribe_overrides_backoff() {
    let h = harness_with(
        SyncServerConfig {
            sweep_interval_ms: 60_000,
            retry_initial_delay_ms: 60_000,
            ..Default::default()
        },
        1000,
    );
    let creds = h.server.register_client(None, None).await.unwrap();
    let mut inbox = h.bus.subscribe(&h.server.out_channel(&creds.client_id));
    h.server.outbound().backoff().record_failure(&creds.client_id);

    let handle = spawn_run(&h);
    wait_for_state(&h.server, ServerState::Running).await;

    // The change-triggered sweep skips the client in backoff
    h.server.save_local("patient", Record::new("p1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(inbox.try_recv(), Err(broadcast::error::TryRecvError::Empty)));

    let reply = h
        .server
        .receive(
            Message::new("/meta/subscribe")
                .with_subscription(h.server.out_channel(&creds.client_id))
                .with_credentials(&creds),
        )
        .await;
    assert!(reply.error.is_none());

    let message = recv(&mut inbox).await;
    assert_eq!(message.record_id, "p1");
    for _ in 0..200 {
        if h.server.outbound().backoff().failures(&creds.client_id) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.server.outbound().backoff().failures(&creds.client_id), 0);

    h.server.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn run_loop_picks_up_config_updates() {
    let h = harness();
    let handle = spawn_run(&h);
    wait_for_state(&h.server, ServerState::Running).await;

    let updated = SyncServerConfig {
        sweep_interval_ms: 250,
        active_window_secs: 60,
        ..Default::default()
    };
    h.config_tx.send(updated.clone()).unwrap();

    for _ in 0..200 {
        if h.server.config() == updated {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.server.config().active_window_secs, 60);

    h.server.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn run_loop_lifecycle_and_single_runner() {
    let h = harness();
    assert_eq!(h.server.state(), ServerState::Created);

    let handle = spawn_run(&h);
    wait_for_state(&h.server, ServerState::Running).await;
    assert!(h.server.is_running());

    // A second run returns immediately
    tokio::time::timeout(Duration::from_secs(1), h.server.run())
        .await
        .expect("second run should return at once");

    h.server.shutdown().await;
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("run loop should stop after shutdown")
        .unwrap();
    assert_eq!(h.server.state(), ServerState::ShuttingDown);
}

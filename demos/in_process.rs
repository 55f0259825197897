// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process facility sync example.
//!
//! Demonstrates:
//! 1. Wiring a sync server over in-memory stores and the local bus
//! 2. Two tablets at one hospital logging in and subscribing
//! 3. A save from one tablet reaching the other (partial vs full records)
//! 4. A field-level conflict resolved by last-writer-wins
//! 5. A forged credential being turned away
//! 6. Displaying metrics
//! 7. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example in_process
//! ```

use std::sync::Arc;
use std::time::Duration;

use facility_sync::storage::{InMemoryClientStore, InMemoryRecordStore};
use facility_sync::{
    Credentials, Facility, LocalBus, Message, OutboundMessage, RecordStore, SchemaPolicy, SchemaRegistry,
    ServerState, SyncServer, SyncServerConfig,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures everything the server emits)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           facility-sync: In-Process Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the server
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring sync server...");

    let config = SyncServerConfig {
        // Sweep often so the demo never waits long
        sweep_interval_ms: 500,
        ..Default::default()
    };
    let (_config_tx, config_rx) = watch::channel(config.clone());

    let schemas = SchemaRegistry::builder()
        // Clients see only these fields until a facility allow-lists the patient
        .register(SchemaPolicy::new("patient").with_selectors(["displayId", "firstName", "lastName"]))
        .register(SchemaPolicy::new("medication"))
        .build();

    let records = Arc::new(InMemoryRecordStore::from_config(&config));
    let bus = Arc::new(LocalBus::new());
    let server = Arc::new(SyncServer::new(
        config,
        config_rx,
        records.clone(),
        Arc::new(InMemoryClientStore::new()),
        schemas,
        bus.clone(),
    ));
    println!("   State: {}", server.state());

    let runner = server.clone();
    let run_handle = tokio::spawn(async move { runner.run().await });
    let mut state = server.state_receiver();
    while *state.borrow_and_update() != ServerState::Running {
        state.changed().await?;
    }
    println!("   ✅ Server running! sync-in channel: {}", server.sync_in_channel());

    // The hospital allow-lists one patient for full sync
    let hospital = Facility::new("hospital-1").with_fully_synced("patient", "p-full");
    server.save_local("hospital", hospital.to_record()).await?;

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Two tablets log in and subscribe
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📱 Logging in two tablets...");
    let ward = server.register_client(Some("hospital-1".into()), None).await?;
    let clinic = server.register_client(Some("hospital-1".into()), None).await?;
    println!("   └─ ward:   {}", ward.client_id);
    println!("   └─ clinic: {}", clinic.client_id);

    let mut clinic_inbox = bus.subscribe(&server.out_channel(&clinic.client_id));
    let reply = server
        .receive(
            Message::new("/meta/subscribe")
                .with_subscription(server.out_channel(&clinic.client_id))
                .with_credentials(&clinic),
        )
        .await;
    println!("   └─ clinic subscribed (error: {:?})", reply.error);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Ward saves two patients; clinic receives them
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Ward pushes two patients...");
    for id in ["p-partial", "p-full"] {
        let reply = push(
            &server,
            &ward,
            json!({
                "action": "SAVE",
                "recordType": "patient",
                "record": {
                    "_id": id,
                    "displayId": id.to_uppercase(),
                    "firstName": "Amara",
                    "lastName": "Okafor",
                    "diagnosis": "malaria",
                    "createdBy": "ward",
                    "modifiedFields": {"displayId": 1, "firstName": 1, "lastName": 1, "diagnosis": 1}
                }
            }),
        )
        .await;
        println!("   └─ {} saved (error: {:?})", id, reply.error);
    }

    println!("\n📬 Clinic inbox:");
    for _ in 0..2 {
        let message = next_message(&mut clinic_inbox).await?;
        let record = message.record.unwrap_or(Value::Null);
        println!(
            "   └─ {} {}/{} @ {} fullySynced={} diagnosis={}",
            message.action, message.record_type, message.record_id, message.timestamp,
            record["fullySynced"], record["diagnosis"]
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Conflicting edits resolve per field
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⚔️  Clinic edits p-full: one stale field, one fresh field...");
    push(
        &server,
        &ward,
        json!({
            "action": "SAVE", "recordType": "patient",
            "record": {"_id": "p-full", "firstName": "Amarachi", "modifiedFields": {"firstName": 10}}
        }),
    )
    .await;
    push(
        &server,
        &clinic,
        json!({
            "action": "SAVE", "recordType": "patient",
            "record": {
                "_id": "p-full",
                "firstName": "Ama",
                "lastName": "Okafor-Bello",
                "modifiedFields": {"firstName": 5, "lastName": 12}
            }
        }),
    )
    .await;

    if let Some(merged) = records.find_one("patient", "p-full").await? {
        println!("   └─ firstName = {} (ward's stamp 10 beat clinic's 5)", merged.get("firstName").unwrap_or(&Value::Null));
        println!("   └─ lastName  = {} (clinic's stamp 12 was newest)", merged.get("lastName").unwrap_or(&Value::Null));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. A forged credential
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔐 Pushing with a forged secret...");
    let forged = Credentials {
        client_id: ward.client_id.clone(),
        client_secret: "guess".into(),
    };
    let reply = push(
        &server,
        &forged,
        json!({"action": "REMOVE", "recordType": "patient", "recordId": "p-full"}),
    )
    .await;
    println!("   └─ rejected: {:?}", reply.error);
    println!(
        "   └─ p-full still stored: {}",
        records.find_one("patient", "p-full").await?.is_some()
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Watermarks and raw metrics
    // ─────────────────────────────────────────────────────────────────────────
    // Let the change-triggered sweeps settle
    tokio::time::sleep(Duration::from_millis(200)).await;

    println!("\n📍 Watermarks:");
    for (name, creds) in [("ward", &ward), ("clinic", &clinic)] {
        if let Some(client) = server.clients().get(&creds.client_id).await? {
            println!("   └─ {}: syncOut={}", name, client.sync_out);
        }
    }

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    server.shutdown().await;
    run_handle.await?;
    println!("   ✅ Shutdown complete! State: {}", server.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

async fn push(server: &SyncServer, creds: &Credentials, data: Value) -> Message {
    server
        .receive(
            Message::new(server.sync_in_channel())
                .with_data(data)
                .with_credentials(creds),
        )
        .await
}

async fn next_message(inbox: &mut broadcast::Receiver<Value>) -> Result<OutboundMessage, Box<dyn std::error::Error>> {
    let value = tokio::time::timeout(Duration::from_secs(2), inbox.recv()).await??;
    Ok(serde_json::from_value(value)?)
}

/// Dump all captured metrics, grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let max = samples.iter().map(|v| v.into_inner()).fold(0.0, f64::max);
                histograms.push((name, label_str, count, sum, max));
            }
        }
    }

    counters.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
    gauges.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
    histograms.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }

    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }

    if !histograms.is_empty() {
        println!("   └─ Histograms (distributions)");
        for (name, labels, count, sum, max) in &histograms {
            let avg = if *count > 0 { sum / *count as f64 } else { 0.0 };
            println!("   │  └─ {}{} count={} avg={:.6} max={:.6}", name, labels, count, avg, max);
        }
    }

    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}

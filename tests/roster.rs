//! Live roster behavior: snapshot shape, coalesced broadcast, eviction.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

use statix::live::LiveRoster;
use statix::store::{SqliteStore, Store};
use statix::types::Node;

fn open_store() -> (TempDir, Arc<SqliteStore>) {
    let dir = TempDir::new().expect("temp dir");
    let store = Arc::new(SqliteStore::new(dir.path().join("statix.db")).expect("open"));
    store.initialize().expect("initialize");
    (dir, store)
}

fn insert_node(store: &SqliteStore, id: &str) {
    let now = Utc::now();
    store
        .create_node(&Node {
            id: id.to_string(),
            name: Some(format!("node-{id}")),
            auth_token_hash: None,
            last_seen_at: None,
            created_at: now,
            updated_at: now,
        })
        .expect("create node");
}

#[tokio::test]
async fn test_snapshot_frame_shape() {
    let (_dir, store) = open_store();
    insert_node(&store, "n1");

    let frame = statix::live::snapshot_frame(store.as_ref()).expect("snapshot");
    let parsed: Value = serde_json::from_str(&frame).expect("valid json");
    assert_eq!(parsed["type"], "nodes_snapshot");
    let nodes = parsed["nodes"].as_array().expect("nodes array");
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["id"], "n1");
    assert_eq!(nodes[0]["publishCount"], 0);
}

#[tokio::test]
async fn test_burst_of_changes_coalesces_to_one_broadcast() {
    let (_dir, store) = open_store();
    insert_node(&store, "n1");

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let roster = LiveRoster::spawn(store.clone(), shutdown_rx);

    let (tx_a, mut rx_a) = mpsc::channel::<String>(32);
    let (tx_b, mut rx_b) = mpsc::channel::<String>(32);
    roster.subscribe(tx_a).await;
    roster.subscribe(tx_b).await;

    // 50 signals well inside the debounce window.
    for _ in 0..50 {
        roster.changed();
    }

    tokio::time::sleep(Duration::from_millis(300)).await;

    for rx in [&mut rx_a, &mut rx_b] {
        let frame = rx.try_recv().expect("exactly one frame");
        let parsed: Value = serde_json::from_str(&frame).expect("valid json");
        assert_eq!(parsed["type"], "nodes_snapshot");
        assert!(rx.try_recv().is_err(), "burst produced more than one frame");
    }

    // A later signal produces a fresh broadcast.
    roster.changed();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx_a.try_recv().is_ok());
    assert!(rx_b.try_recv().is_ok());
}

#[tokio::test]
async fn test_unsubscribed_client_stops_receiving() {
    let (_dir, store) = open_store();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let roster = LiveRoster::spawn(store.clone(), shutdown_rx);

    let (tx_a, mut rx_a) = mpsc::channel::<String>(32);
    let (tx_b, mut rx_b) = mpsc::channel::<String>(32);
    let id_a = roster.subscribe(tx_a).await;
    roster.subscribe(tx_b).await;

    roster.unsubscribe(id_a).await;
    roster.changed();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_ok());
}

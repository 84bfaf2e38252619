//! Broker ingest: subscribes to the node topic tree, validates payloads,
//! commits them, and signals the live roster.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::watch;

use crate::config::BrokerConfig;
use crate::error::Error;
use crate::live::LiveRoster;
use crate::store::Store;
use crate::types::{MetricsPayload, SystemInfoPayload};

pub const TOPIC_FILTER: &str = "statix/nodes/+/+";

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Metrics,
    System,
}

/// Splits `statix/nodes/<nodeId>/<channel>` into its parts. Anything else
/// is ignored silently.
pub fn route_topic(topic: &str) -> Option<(&str, Channel)> {
    let rest = topic.strip_prefix("statix/nodes/")?;
    let (node_id, channel) = rest.split_once('/')?;
    if node_id.is_empty() || channel.contains('/') {
        return None;
    }
    match channel {
        "metrics" => Some((node_id, Channel::Metrics)),
        "system" => Some((node_id, Channel::System)),
        _ => None,
    }
}

/// Applies one inbound publish to the store. Returns true when the roster
/// changed. Per-message failures are logged and dropped; they never
/// propagate.
pub fn apply(store: &dyn Store, topic: &str, payload: &[u8]) -> bool {
    let Some((node_id, channel)) = route_topic(topic) else {
        return false;
    };

    match channel {
        Channel::Metrics => {
            let parsed: MetricsPayload = match serde_json::from_slice(payload) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!("malformed metrics payload on {topic}: {e}");
                    return false;
                }
            };
            if let Err(reason) = parsed.validate() {
                tracing::warn!("invalid metrics payload on {topic}: {reason}");
                return false;
            }
            match store.append_metric(node_id, &parsed) {
                Ok(()) => true,
                Err(Error::NotFound) => {
                    tracing::warn!("dropping metrics for unknown node {node_id}");
                    false
                }
                Err(e) => {
                    tracing::warn!("failed to store metrics for node {node_id}: {e}");
                    false
                }
            }
        }
        Channel::System => {
            let parsed: SystemInfoPayload = match serde_json::from_slice(payload) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!("malformed system info payload on {topic}: {e}");
                    return false;
                }
            };
            if let Err(reason) = parsed.validate() {
                tracing::warn!("invalid system info payload on {topic}: {reason}");
                return false;
            }
            match store.upsert_system_info(node_id, &parsed) {
                Ok(changed) => changed,
                Err(Error::NotFound) => {
                    tracing::warn!("dropping system info for unknown node {node_id}");
                    false
                }
                Err(e) => {
                    tracing::warn!("failed to store system info for node {node_id}: {e}");
                    false
                }
            }
        }
    }
}

/// The ingest loop. Runs until shutdown; survives broker disconnects with a
/// fixed reconnect delay and per-message failures unconditionally.
pub async fn run(
    store: Arc<dyn Store>,
    roster: LiveRoster,
    broker: BrokerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut options = MqttOptions::new("statix-server", broker.host.clone(), broker.port);
    options.set_keep_alive(Duration::from_secs(30));
    if !broker.username.is_empty() {
        options.set_credentials(broker.username.clone(), broker.password.clone());
    }

    let (client, mut eventloop) = AsyncClient::new(options, 64);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = client.disconnect().await;
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // Subscriptions do not survive a reconnect.
                    match client.subscribe(TOPIC_FILTER, QoS::AtLeastOnce).await {
                        Ok(()) => tracing::info!("subscribed to {TOPIC_FILTER}"),
                        Err(e) => tracing::error!("subscribe failed: {e}"),
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if apply(store.as_ref(), &publish.topic, &publish.payload) {
                        roster.changed();
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("broker connection error: {e}; reconnecting");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use chrono::Utc;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().expect("temp dir");
        let store = SqliteStore::new(dir.path().join("statix.db")).expect("open");
        store.initialize().expect("initialize");
        (dir, store)
    }

    fn insert_node(store: &SqliteStore, id: &str) {
        let now = Utc::now();
        store
            .create_node(&crate::types::Node {
                id: id.to_string(),
                name: None,
                auth_token_hash: None,
                last_seen_at: None,
                created_at: now,
                updated_at: now,
            })
            .expect("create node");
    }

    const METRICS: &str = r#"{"v":1,"ts":1700000000000,"cpu":0.5,"mem_used":1,
        "mem_total":2,"disk_used":0,"disk_total":1,"net_rx":0,"net_tx":0}"#;

    #[test]
    fn test_route_topic() {
        assert_eq!(
            route_topic("statix/nodes/n1/metrics"),
            Some(("n1", Channel::Metrics))
        );
        assert_eq!(
            route_topic("statix/nodes/n1/system"),
            Some(("n1", Channel::System))
        );
        assert_eq!(route_topic("statix/nodes/n1/other"), None);
        assert_eq!(route_topic("statix/nodes/metrics"), None);
        assert_eq!(route_topic("statix/nodes//metrics"), None);
        assert_eq!(route_topic("other/nodes/n1/metrics"), None);
    }

    #[test]
    fn test_apply_commits_metrics() {
        let (_dir, store) = open_store();
        insert_node(&store, "n1");

        assert!(apply(&store, "statix/nodes/n1/metrics", METRICS.as_bytes()));
        let rows = store.list_recent_metrics("n1", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cpu, 0.5);
    }

    #[test]
    fn test_apply_drops_malformed_json() {
        let (_dir, store) = open_store();
        insert_node(&store, "n1");

        assert!(!apply(&store, "statix/nodes/n1/metrics", b"{not json"));
        assert!(store.list_recent_metrics("n1", 10).unwrap().is_empty());
    }

    #[test]
    fn test_apply_drops_invalid_payload() {
        let (_dir, store) = open_store();
        insert_node(&store, "n1");

        let bad = METRICS.replace("0.5", "1.5");
        assert!(!apply(&store, "statix/nodes/n1/metrics", bad.as_bytes()));
        assert!(store.list_recent_metrics("n1", 10).unwrap().is_empty());
    }

    #[test]
    fn test_apply_drops_unknown_node() {
        let (_dir, store) = open_store();
        assert!(!apply(
            &store,
            "statix/nodes/missing/metrics",
            METRICS.as_bytes()
        ));
    }

    #[test]
    fn test_apply_system_info_reports_change() {
        let (_dir, store) = open_store();
        insert_node(&store, "n1");

        let payload = r#"{"v":1,"ts":1700000000000,"hash":"aa","info":{
            "osPlatform":"linux","osRelease":"6.1","osArch":"x86_64",
            "hostname":"h","cpuModel":"c","cpuCores":4,"memTotal":1024,"gpus":[]}}"#;

        assert!(apply(&store, "statix/nodes/n1/system", payload.as_bytes()));
        // Identical hash: committed but unchanged, no roster signal.
        assert!(!apply(&store, "statix/nodes/n1/system", payload.as_bytes()));
    }
}

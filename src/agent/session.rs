//! One broker session: connect, publish on the timers, rotate on credential
//! change. The outer loop owns reconnection; a session ends instead of
//! retrying.

use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS, Transport};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at, timeout};

use super::{collect, inventory};
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::types::BrokerCredentials;

pub enum SessionEnd {
    Shutdown,
    Rotate(BrokerCredentials),
    ConnectionLost,
}

pub async fn run(
    config: &AgentConfig,
    http: &reqwest::Client,
    credentials: BrokerCredentials,
    stop: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let client_id = format!("statix-agent-{}", config.node_id);
    // Port 9001 is the broker's websocket listener by convention.
    let mut options = if credentials.port == 9001 {
        let url = format!("ws://{}:{}/mqtt", credentials.host, credentials.port);
        let mut options = MqttOptions::new(client_id, url, credentials.port);
        options.set_transport(Transport::Ws);
        options
    } else {
        MqttOptions::new(client_id, credentials.host.clone(), credentials.port)
    };
    options.set_keep_alive(Duration::from_secs(30));
    if !credentials.username.is_empty() {
        options.set_credentials(credentials.username.clone(), credentials.password.clone());
    }

    let (client, mut eventloop) = AsyncClient::new(options, 16);

    match timeout(config.connect_timeout(), wait_for_connack(&mut eventloop)).await {
        Ok(Ok(())) => {
            tracing::info!(
                "connected to broker at {}:{}",
                credentials.host,
                credentials.port
            );
        }
        Ok(Err(e)) => {
            tracing::warn!("broker connect failed: {e}");
            return SessionEnd::ConnectionLost;
        }
        Err(_) => {
            tracing::warn!("broker connect timed out");
            return SessionEnd::ConnectionLost;
        }
    }

    let metrics_topic = config.metrics_topic();
    let system_topic = config.system_topic();

    // First metrics and inventory publishes fire immediately; the exchange
    // refresh only after a full period (we just exchanged).
    let mut metrics_tick = interval(config.publish_interval());
    metrics_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut system_tick = interval(config.system_info_check_interval());
    system_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut exchange_tick = interval_at(
        Instant::now() + config.exchange_interval(),
        config.exchange_interval(),
    );
    exchange_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut metrics_in_flight = false;
    let mut last_inventory_hash: Option<String> = None;
    let mut last_inventory_publish: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = stop.changed() => {
                let _ = client.disconnect().await;
                return SessionEnd::Shutdown;
            }
            event = eventloop.poll() => match event {
                // The guard is approximate: inventory acks clear it too,
                // which is harmless at the inventory cadence.
                Ok(Event::Incoming(Packet::PubAck(_))) => metrics_in_flight = false,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("broker connection lost: {e}");
                    return SessionEnd::ConnectionLost;
                }
            },
            _ = metrics_tick.tick() => {
                if metrics_in_flight {
                    tracing::debug!("metrics publish still in flight; skipping tick");
                    continue;
                }
                let sample = collect::sample();
                match serde_json::to_vec(&sample) {
                    Ok(body) => match client.try_publish(&metrics_topic, QoS::AtLeastOnce, false, body) {
                        Ok(()) => metrics_in_flight = true,
                        Err(e) => tracing::warn!("metrics publish failed: {e}"),
                    },
                    Err(e) => tracing::warn!("metrics serialization failed: {e}"),
                }
            }
            _ = system_tick.tick() => {
                let payload = inventory::collect();
                let fresh = last_inventory_publish
                    .is_none_or(|at| at.elapsed() >= config.system_info_republish_interval());
                let hash_changed = last_inventory_hash.as_deref() != Some(payload.hash.as_str());
                if !hash_changed && !fresh {
                    continue;
                }
                match serde_json::to_vec(&payload) {
                    Ok(body) => match client.try_publish(&system_topic, QoS::AtLeastOnce, true, body) {
                        Ok(()) => {
                            last_inventory_hash = Some(payload.hash);
                            last_inventory_publish = Some(Instant::now());
                        }
                        Err(e) => tracing::warn!("inventory publish failed: {e}"),
                    },
                    Err(e) => tracing::warn!("inventory serialization failed: {e}"),
                }
            }
            _ = exchange_tick.tick() => {
                match super::exchange(http, config).await {
                    Ok(next) => {
                        if next != credentials {
                            tracing::info!("broker credentials rotated; reconnecting");
                            let _ = client.disconnect().await;
                            return SessionEnd::Rotate(next);
                        }
                    }
                    Err(e) => tracing::warn!("credential refresh failed: {e}"),
                }
            }
        }
    }
}

async fn wait_for_connack(eventloop: &mut rumqttc::EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(Error::Broker(format!(
                    "broker rejected connection: {:?}",
                    ack.code
                )));
            }
            Ok(_) => {}
            Err(e) => return Err(Error::Broker(e.to_string())),
        }
    }
}

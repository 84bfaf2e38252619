//! The per-host agent: exchanges its node credential for broker coordinates,
//! publishes metrics and inventory, and reconnects on credential rotation.

mod collect;
mod inventory;
mod session;

use std::time::Duration;

use tokio::sync::watch;

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::types::BrokerCredentials;

pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    config.validate()?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let (stop_tx, stop) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown requested");
        let _ = stop_tx.send(true);
    });

    let mut stop_rx = stop.clone();
    let mut rotate_to: Option<BrokerCredentials> = None;

    while !*stop_rx.borrow() {
        // A rotation carries the fresh credentials into the next session,
        // saving one exchange round-trip.
        let credentials = match rotate_to.take() {
            Some(credentials) => credentials,
            None => match exchange(&http, &config).await {
                Ok(credentials) => credentials,
                Err(e) => {
                    tracing::warn!("credential exchange failed: {e}");
                    if sleep_or_stop(&mut stop_rx, config.reconnect_delay()).await {
                        break;
                    }
                    continue;
                }
            },
        };

        match session::run(&config, &http, credentials, &mut stop_rx).await {
            session::SessionEnd::Shutdown => break,
            session::SessionEnd::Rotate(next) => rotate_to = Some(next),
            session::SessionEnd::ConnectionLost => {}
        }

        if *stop_rx.borrow() || sleep_or_stop(&mut stop_rx, config.reconnect_delay()).await {
            break;
        }
    }

    tracing::info!("agent stopped");
    Ok(())
}

/// Returns true when the sleep was interrupted by shutdown.
async fn sleep_or_stop(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stop.changed() => true,
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// POSTs the node credential to the exchange endpoint.
pub(crate) async fn exchange(
    http: &reqwest::Client,
    config: &AgentConfig,
) -> Result<BrokerCredentials> {
    #[derive(serde::Deserialize)]
    struct ExchangeResponse {
        mqtt: BrokerCredentials,
    }

    let url = format!(
        "{}/nodes/auth/exchange",
        config.api_base_url.trim_end_matches('/')
    );
    let response = http
        .post(&url)
        .json(&serde_json::json!({
            "nodeId": config.node_id,
            "nodeToken": config.node_token,
        }))
        .send()
        .await
        .map_err(|e| Error::Broker(format!("exchange request failed: {e}")))?;

    if !response.status().is_success() {
        return Err(Error::Broker(format!(
            "exchange returned {}",
            response.status()
        )));
    }

    let body: ExchangeResponse = response
        .json()
        .await
        .map_err(|e| Error::Broker(format!("malformed exchange response: {e}")))?;
    Ok(body.mqtt)
}

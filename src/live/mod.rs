//! Live roster fan-out.
//!
//! A single owner task holds the connected-socket map and the debounce
//! state; everything else talks to it through messages, so there is no race
//! between a broadcast and a socket close.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};

use crate::error::Result;
use crate::store::Store;

/// Bursts of change signals within this window collapse into one broadcast.
pub const DEBOUNCE: Duration = Duration::from_millis(150);

enum RosterMsg {
    Subscribe { id: u64, tx: mpsc::Sender<String> },
    Unsubscribe { id: u64 },
    Changed,
    Flush,
}

/// Handle to the roster task. Cheap to clone.
#[derive(Clone)]
pub struct LiveRoster {
    tx: mpsc::Sender<RosterMsg>,
    next_id: Arc<AtomicU64>,
}

impl LiveRoster {
    pub fn spawn(store: Arc<dyn Store>, shutdown: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let roster = Self {
            tx: tx.clone(),
            next_id: Arc::new(AtomicU64::new(1)),
        };
        tokio::spawn(run(store, tx, rx, shutdown));
        roster
    }

    /// Registers a socket's frame sender and returns its subscription id.
    pub async fn subscribe(&self, frames: mpsc::Sender<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(RosterMsg::Subscribe { id, tx: frames }).await;
        id
    }

    pub async fn unsubscribe(&self, id: u64) {
        let _ = self.tx.send(RosterMsg::Unsubscribe { id }).await;
    }

    /// Signals that the roster may have changed. Callable from sync code.
    pub fn changed(&self) {
        let _ = self.tx.try_send(RosterMsg::Changed);
    }
}

/// Builds the one frame type of the roster protocol.
pub fn snapshot_frame(store: &dyn Store) -> Result<String> {
    let nodes = store.list_nodes_with_stats()?;
    Ok(serde_json::to_string(&json!({
        "type": "nodes_snapshot",
        "nodes": nodes,
    }))?)
}

async fn run(
    store: Arc<dyn Store>,
    self_tx: mpsc::Sender<RosterMsg>,
    mut rx: mpsc::Receiver<RosterMsg>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut clients: HashMap<u64, mpsc::Sender<String>> = HashMap::new();
    let mut flush_pending = false;

    loop {
        let msg = tokio::select! {
            _ = shutdown.changed() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        match msg {
            RosterMsg::Subscribe { id, tx } => {
                clients.insert(id, tx);
                tracing::debug!("roster client {id} connected ({} total)", clients.len());
            }
            RosterMsg::Unsubscribe { id } => {
                clients.remove(&id);
            }
            RosterMsg::Changed => {
                if !flush_pending {
                    flush_pending = true;
                    let tx = self_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(DEBOUNCE).await;
                        let _ = tx.send(RosterMsg::Flush).await;
                    });
                }
            }
            RosterMsg::Flush => {
                flush_pending = false;
                match snapshot_frame(store.as_ref()) {
                    Ok(frame) => {
                        let mut dead = Vec::new();
                        for (id, tx) in &clients {
                            // A client that stopped draining its queue is
                            // treated as gone.
                            if tx.try_send(frame.clone()).is_err() {
                                dead.push(*id);
                            }
                        }
                        for id in dead {
                            clients.remove(&id);
                        }
                    }
                    Err(e) => tracing::warn!("roster snapshot failed: {e}"),
                }
            }
        }
    }

    clients.clear();
}

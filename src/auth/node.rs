//! Node credential issuance and exchange.
//!
//! A node holds one long-lived bearer whose digest lives on its row. The
//! agent trades that bearer for broker coordinates; the coordinates are
//! shared and static in this version (`expires_at: None`), with the schema
//! reserving per-node rotation columns.

use super::token::{MintedToken, hash_token, mint_token};
use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::BrokerCredentials;

/// Mints the long-lived node bearer shown once at node-create time.
#[must_use]
pub fn create_node_token() -> MintedToken {
    mint_token()
}

/// Exchanges a node bearer for broker coordinates. Unknown nodes, nodes
/// without a credential, and digest mismatches all fail identically.
pub fn exchange(
    store: &dyn Store,
    broker: &BrokerConfig,
    node_id: &str,
    node_token: &str,
) -> Result<BrokerCredentials> {
    let Some(node) = store.find_node(node_id)? else {
        return Err(Error::Unauthorized);
    };
    let Some(stored) = node.auth_token_hash.as_deref() else {
        return Err(Error::Unauthorized);
    };
    if hash_token(node_token) != stored {
        return Err(Error::Unauthorized);
    }

    Ok(BrokerCredentials {
        host: broker.host.clone(),
        port: broker.port,
        username: broker.username.clone(),
        password: broker.password.clone(),
        expires_at: None,
    })
}

//! # Statix
//!
//! A minimal fleet-telemetry platform: per-host agents publish periodic
//! metrics and a slow-changing system inventory over MQTT; the server
//! ingests and persists them, authenticates operators and agents, and pushes
//! a live node roster to dashboard websockets.
//!
//! ## Library Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use statix::auth::PasswordHasher;
//! use statix::config::BrokerConfig;
//! use statix::live::LiveRoster;
//! use statix::server::{AppState, create_router};
//! use statix::store::SqliteStore;
//!
//! let store = Arc::new(SqliteStore::new("./data/statix.db").unwrap());
//! store.initialize().unwrap();
//!
//! let (_, shutdown) = tokio::sync::watch::channel(false);
//! let roster = LiveRoster::spawn(store.clone(), shutdown);
//! let state = Arc::new(AppState {
//!     store,
//!     hasher: PasswordHasher::new(),
//!     roster,
//!     broker: BrokerConfig::default(),
//!     version: env!("CARGO_PKG_VERSION"),
//! });
//! let router = create_router(state);
//! // Serve with axum...
//! ```
//!
//! ## Feature Flags
//!
//! - `agent` (default): Includes the agent module. Disable with
//!   `default-features = false` for a server-only build.

#[cfg(feature = "agent")]
pub mod agent;
pub mod auth;
pub mod config;
pub mod error;
pub mod hash;
pub mod ingest;
pub mod live;
pub mod server;
pub mod store;
pub mod types;

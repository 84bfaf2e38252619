use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use statix::auth::{PasswordHasher, bootstrap};
use statix::config::{ServerConfig, ServerConfigOverrides};
use statix::live::LiveRoster;
use statix::server::{AppState, create_router};
use statix::store::{SqliteStore, Store};

#[derive(Parser)]
#[command(name = "statix")]
#[command(about = "A minimal fleet-telemetry platform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (HTTP API, roster websocket, broker ingest)
    Serve {
        /// Path to a TOML config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(long, short)]
        port: Option<u16>,

        /// Data directory for the database
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// MQTT broker host
        #[arg(long)]
        broker_host: Option<String>,

        /// MQTT broker port
        #[arg(long)]
        broker_port: Option<u16>,
    },

    /// Start the per-host agent
    #[cfg(feature = "agent")]
    Agent {
        /// Path to a TOML config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Node id issued at node creation
        #[arg(long)]
        node_id: Option<String>,

        /// Node bearer token issued at node creation
        #[arg(long)]
        node_token: Option<String>,

        /// Base URL of the server API
        #[arg(long)]
        api_base_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("statix=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            host,
            port,
            data_dir,
            broker_host,
            broker_port,
        } => {
            let config = ServerConfig::load_with_overrides(
                config.as_deref(),
                ServerConfigOverrides {
                    host,
                    port,
                    data_dir,
                    broker_host,
                    broker_port,
                },
            )?;
            serve(config).await?;
        }
        #[cfg(feature = "agent")]
        Commands::Agent {
            config,
            node_id,
            node_token,
            api_base_url,
        } => {
            let config = statix::config::AgentConfig::load_with_overrides(
                config.as_deref(),
                statix::config::AgentConfigOverrides {
                    node_id,
                    node_token,
                    api_base_url,
                },
            )?;
            statix::agent::run(config).await?;
        }
    }

    Ok(())
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(SqliteStore::new(config.db_path())?);
    store.initialize()?;

    if let Some(token) = bootstrap::prestart(store.as_ref())? {
        info!("[bootstrap] token={token}");
        info!("bootstrap pending; claim the admin account with the token above");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let roster = LiveRoster::spawn(store.clone(), shutdown_rx.clone());
    tokio::spawn(statix::ingest::run(
        store.clone(),
        roster.clone(),
        config.broker.clone(),
        shutdown_rx.clone(),
    ));

    let state = Arc::new(AppState {
        store: store.clone(),
        hasher: PasswordHasher::new(),
        roster,
        broker: config.broker.clone(),
        version: env!("CARGO_PKG_VERSION"),
    });

    let app = create_router(state);
    let addr = config.socket_addr()?;

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutting down");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
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

use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::watch;

use statix::auth::{PasswordHasher, bootstrap};
use statix::config::BrokerConfig;
use statix::live::LiveRoster;
use statix::server::{AppState, create_router};
use statix::store::{SqliteStore, Store};

/// In-process server over a scratch database on an ephemeral port. The
/// broker is not started; ingest paths are exercised through
/// `statix::ingest::apply` against the shared store.
pub struct TestServer {
    #[allow(dead_code)]
    pub temp_dir: TempDir,
    pub base_url: String,
    pub store: Arc<SqliteStore>,
    #[allow(dead_code)]
    pub roster: LiveRoster,
    pub bootstrap_token: String,
    // Dropping the sender would end the roster task early.
    _shutdown: watch::Sender<bool>,
}

impl TestServer {
    pub async fn start() -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let store =
            Arc::new(SqliteStore::new(temp_dir.path().join("statix.db")).expect("open database"));
        store.initialize().expect("initialize schema");

        let bootstrap_token = bootstrap::prestart(store.as_ref())
            .expect("prestart")
            .expect("bootstrap token");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let roster = LiveRoster::spawn(store.clone(), shutdown_rx);

        let state = Arc::new(AppState {
            store: store.clone(),
            hasher: PasswordHasher::new(),
            roster: roster.clone(),
            broker: BrokerConfig::default(),
            version: env!("CARGO_PKG_VERSION"),
        });
        let app = create_router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        Self {
            temp_dir,
            base_url: format!("http://{addr}"),
            store,
            roster,
            bootstrap_token,
            _shutdown: shutdown_tx,
        }
    }

    /// Claims the bootstrap admin and logs in, returning the admin bearer.
    pub async fn claim_admin(&self, email: &str, password: &str) -> String {
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/auth/bootstrap/claim", self.base_url))
            .json(&serde_json::json!({
                "token": self.bootstrap_token,
                "email": email,
                "password": password,
                "displayName": "Admin",
            }))
            .send()
            .await
            .expect("claim request");
        assert!(
            resp.status().is_success(),
            "bootstrap claim failed: {}",
            resp.status()
        );

        self.login(email, password).await
    }

    pub async fn login(&self, email: &str, password: &str) -> String {
        let client = reqwest::Client::new();
        let body: serde_json::Value = client
            .post(format!("{}/auth/login", self.base_url))
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .expect("login request")
            .json()
            .await
            .expect("login body");
        body["token"].as_str().expect("bearer token").to_string()
    }
}

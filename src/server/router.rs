use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{
    Router,
    routing::{delete, get, patch, post},
};

use super::{auth_routes, nodes, ws};
use crate::auth::PasswordHasher;
use crate::config::BrokerConfig;
use crate::live::LiveRoster;
use crate::store::Store;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub hasher: PasswordHasher,
    pub roster: LiveRoster,
    pub broker: BrokerConfig,
    pub version: &'static str,
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status();

    tracing::info!(
        "{} {} {} {}ms",
        method,
        uri.path(),
        status.as_u16(),
        latency.as_millis()
    );

    response
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(auth_routes::health))
        .route("/db/health", get(auth_routes::db_health))
        .route("/auth/bootstrap/status", get(auth_routes::bootstrap_status))
        .route("/auth/bootstrap/claim", post(auth_routes::bootstrap_claim))
        .route("/auth/login", post(auth_routes::login))
        .route("/auth/me", get(auth_routes::me))
        .route("/auth/logout", post(auth_routes::logout))
        .route("/auth/users", get(auth_routes::list_users))
        .route("/auth/users", post(auth_routes::create_user))
        .route(
            "/auth/users/{user_id}/roles",
            post(auth_routes::replace_user_roles),
        )
        .route("/auth/roles", get(auth_routes::list_roles))
        .route("/auth/roles", post(auth_routes::create_role))
        .route(
            "/auth/roles/{role_name}/permissions",
            post(auth_routes::replace_role_permissions),
        )
        .route("/auth/permissions", get(auth_routes::list_permissions))
        .route("/auth/set-password", post(auth_routes::set_password))
        .route("/nodes", get(nodes::list_nodes))
        .route("/nodes/create", post(nodes::create_node))
        .route("/nodes/auth/exchange", post(nodes::exchange))
        .route("/nodes/{node_id}", patch(nodes::update_node))
        .route("/nodes/{node_id}", delete(nodes::delete_node))
        .route("/nodes/{node_id}/metrics", get(nodes::node_metrics))
        .route("/ws/nodes", get(ws::ws_nodes))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

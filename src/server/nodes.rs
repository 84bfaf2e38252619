use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use ulid::Ulid;

use crate::auth::{RequireAuth, node as node_auth};
use crate::server::AppState;
use crate::server::dto::{
    CreateNodeRequest, CreateNodeResponse, ExchangeRequest, ExchangeResponse, MetricsQuery,
    NodeMetricsResponse, UpdateNodeRequest,
};
use crate::server::response::ApiError;
use crate::types::permission::{
    NODES_CREATE, NODES_DELETE, NODES_READ, node_read_code, node_write_code,
};
use crate::types::{Node, SessionIdentity};

const DEFAULT_METRICS_LIMIT: i64 = 60;

fn can_read_node(identity: &SessionIdentity, node_id: &str) -> bool {
    identity.can(NODES_READ) || identity.can(&node_read_code(node_id))
}

fn can_write_node(identity: &SessionIdentity, node_id: &str) -> bool {
    identity.can(NODES_DELETE) || identity.can(&node_write_code(node_id))
}

pub async fn list_nodes(
    RequireAuth(identity): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let has_broad = identity.can(NODES_READ);
    let has_any_node_read = identity
        .permissions
        .iter()
        .any(|c| c.starts_with("node:read:"));
    if !has_broad && !has_any_node_read {
        return Err(ApiError::forbidden("missing nodes:read permission"));
    }

    let mut nodes = state.store.list_nodes_with_stats()?;
    if !has_broad {
        nodes.retain(|n| identity.can(&node_read_code(&n.id)));
    }
    Ok(Json(nodes))
}

pub async fn node_metrics(
    RequireAuth(identity): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<NodeMetricsResponse>, ApiError> {
    if !can_read_node(&identity, &node_id) {
        return Err(ApiError::forbidden("missing node read permission"));
    }

    if state.store.find_node(&node_id)?.is_none() {
        return Err(ApiError::not_found("node not found"));
    }

    let limit = query.limit.unwrap_or(DEFAULT_METRICS_LIMIT).clamp(1, 300);
    let metrics = state.store.list_recent_metrics(&node_id, limit)?;
    Ok(Json(NodeMetricsResponse { node_id, metrics }))
}

pub async fn create_node(
    RequireAuth(identity): RequireAuth,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateNodeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !identity.can(NODES_CREATE) {
        return Err(ApiError::forbidden("missing nodes:create permission"));
    }

    let minted = node_auth::create_node_token();
    let now = Utc::now();
    let node = Node {
        id: Ulid::new().to_string(),
        name: req.name.clone(),
        auth_token_hash: Some(minted.hash),
        last_seen_at: None,
        created_at: now,
        updated_at: now,
    };
    state.store.create_node(&node)?;

    let api_base_url = headers
        .get(axum::http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|host| format!("http://{host}"))
        .unwrap_or_else(|| "http://127.0.0.1:8080".to_string());
    let env_file = format!(
        "NODE_ID={}\nNODE_TOKEN={}\nAPI_BASE_URL={}\n",
        node.id, minted.plaintext, api_base_url
    );

    state.roster.changed();
    Ok((
        StatusCode::CREATED,
        Json(CreateNodeResponse {
            id: node.id,
            name: node.name,
            created_at: node.created_at,
            token: minted.plaintext,
            env_file,
        }),
    ))
}

pub async fn update_node(
    RequireAuth(identity): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    Json(req): Json<UpdateNodeRequest>,
) -> Result<Json<Node>, ApiError> {
    if !can_write_node(&identity, &node_id) {
        return Err(ApiError::forbidden("missing node write permission"));
    }

    if !state
        .store
        .update_node_name(&node_id, req.name.as_deref())?
    {
        return Err(ApiError::not_found("node not found"));
    }

    let node = state
        .store
        .find_node(&node_id)?
        .ok_or_else(|| ApiError::not_found("node not found"))?;
    state.roster.changed();
    Ok(Json(node))
}

pub async fn delete_node(
    RequireAuth(identity): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !can_write_node(&identity, &node_id) {
        return Err(ApiError::forbidden("missing node write permission"));
    }

    if !state.store.delete_node(&node_id)? {
        return Err(ApiError::not_found("node not found"));
    }
    state.roster.changed();
    Ok(StatusCode::NO_CONTENT)
}

pub async fn exchange(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExchangeRequest>,
) -> Result<Json<ExchangeResponse>, ApiError> {
    if req.node_id.is_empty() || req.node_token.is_empty() {
        return Err(ApiError::bad_request("nodeId and nodeToken are required"));
    }

    let mqtt = node_auth::exchange(
        state.store.as_ref(),
        &state.broker,
        &req.node_id,
        &req.node_token,
    )
    .map_err(|e| match e {
        crate::error::Error::Unauthorized => ApiError::unauthorized("invalid node credentials"),
        other => other.into(),
    })?;

    Ok(Json(ExchangeResponse { mqtt }))
}

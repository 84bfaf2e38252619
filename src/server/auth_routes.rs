use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use serde_json::json;

use crate::auth::{RequireAdmin, RequireAuth, bootstrap, identity};
use crate::error::Error;
use crate::server::AppState;
use crate::server::dto::{
    BootstrapStatusResponse, ClaimRequest, CreateRoleRequest, CreateUserRequest,
    CreateUserResponse, HealthResponse, LoginRequest, LoginResponse, OkResponse,
    ReplacePermissionsRequest, ReplaceRolesRequest, SetPasswordRequest, UserSnapshot,
};
use crate::server::response::ApiError;
use crate::types::{Permission, RoleWithPermissions, UserWithRoles};

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn client_user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: Some(state.version),
    })
}

pub async fn db_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.ping() {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true }))),
        Err(e) => {
            tracing::error!("database health check failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false })),
            )
        }
    }
}

pub async fn bootstrap_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BootstrapStatusResponse>, ApiError> {
    let needs_bootstrap = bootstrap::needs_bootstrap(state.store.as_ref())?;
    Ok(Json(BootstrapStatusResponse { needs_bootstrap }))
}

pub async fn bootstrap_claim(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    if req.token.is_empty() {
        return Err(ApiError::bad_request("token is required"));
    }

    let worker = state.clone();
    tokio::task::spawn_blocking(move || {
        bootstrap::claim(
            worker.store.as_ref(),
            &worker.hasher,
            &req.token,
            &req.email,
            &req.password,
            req.display_name.as_deref(),
        )
    })
    .await
    .map_err(|_| ApiError::internal("claim task failed"))?
    .map_err(|e| match e {
        Error::Forbidden => ApiError::forbidden("token is not eligible for bootstrap claim"),
        other => other.into(),
    })?;

    Ok(Json(OkResponse::ok()))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    if req.email.trim().is_empty() || req.password.is_empty() {
        return Err(ApiError::bad_request("email and password are required"));
    }

    let ip = client_ip(&headers);
    let user_agent = client_user_agent(&headers);

    let worker = state.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        identity::login(
            worker.store.as_ref(),
            &worker.hasher,
            &req.email,
            &req.password,
            ip.as_deref(),
            user_agent.as_deref(),
        )
    })
    .await
    .map_err(|_| ApiError::internal("login task failed"))?
    .map_err(|e| match e {
        Error::Forbidden => ApiError::forbidden("account disabled"),
        other => other.into(),
    })?;

    Ok(Json(LoginResponse {
        token: outcome.token,
        expires_at: outcome.expires_at,
        user: UserSnapshot::from_identity(&outcome.identity),
    }))
}

pub async fn me(RequireAuth(identity): RequireAuth) -> Json<UserSnapshot> {
    Json(UserSnapshot::from_identity(&identity))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<OkResponse>, ApiError> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;

    identity::logout(state.store.as_ref(), bearer)?;
    Ok(Json(OkResponse::ok()))
}

pub async fn list_users(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<UserWithRoles>>, ApiError> {
    let users = state.store.list_users_with_roles()?;
    Ok(Json(users))
}

pub async fn create_user(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let invited =
        identity::create_user(state.store.as_ref(), &req.email, req.display_name.as_deref())
            .map_err(|e| match e {
                Error::AlreadyExists => ApiError::conflict("a user with this email already exists"),
                other => other.into(),
            })?;

    Ok((
        StatusCode::CREATED,
        Json(CreateUserResponse {
            id: invited.user.id,
            email: invited.user.email,
            setup_token: invited.setup_token,
            setup_token_expires_at: invited.setup_token_expires_at,
        }),
    ))
}

pub async fn replace_user_roles(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(req): Json<ReplaceRolesRequest>,
) -> Result<Json<UserWithRoles>, ApiError> {
    let updated = identity::replace_user_roles(state.store.as_ref(), &user_id, &req.role_names)
        .map_err(|e| match e {
            Error::NotFound => ApiError::not_found("user not found"),
            other => other.into(),
        })?;
    Ok(Json(updated))
}

pub async fn list_roles(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RoleWithPermissions>>, ApiError> {
    let roles = state.store.list_roles_with_permissions()?;
    Ok(Json(roles))
}

pub async fn create_role(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRoleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let role = identity::create_role(
        state.store.as_ref(),
        &req.name,
        req.description.as_deref(),
        &req.permission_codes,
    )?;
    Ok((StatusCode::CREATED, Json(role)))
}

pub async fn replace_role_permissions(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(role_name): Path<String>,
    Json(req): Json<ReplacePermissionsRequest>,
) -> Result<Json<RoleWithPermissions>, ApiError> {
    let role = identity::replace_role_permissions(
        state.store.as_ref(),
        &role_name,
        &req.permission_codes,
    )
    .map_err(|e| match e {
        Error::NotFound => ApiError::not_found("role not found"),
        other => other.into(),
    })?;
    Ok(Json(role))
}

pub async fn list_permissions(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Permission>>, ApiError> {
    let permissions = state.store.list_permissions()?;
    Ok(Json(permissions))
}

pub async fn set_password(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetPasswordRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    if req.token.is_empty() {
        return Err(ApiError::bad_request("token is required"));
    }

    let worker = state.clone();
    tokio::task::spawn_blocking(move || {
        identity::set_password(worker.store.as_ref(), &worker.hasher, &req.token, &req.password)
    })
    .await
    .map_err(|_| ApiError::internal("set-password task failed"))?
    .map_err(|e| match e {
        // Expired, consumed, and unknown tokens are indistinguishable.
        Error::Unauthorized => ApiError::unauthorized("invalid or expired token"),
        other => other.into(),
    })?;

    Ok(Json(OkResponse::ok()))
}

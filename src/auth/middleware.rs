use std::sync::Arc;

use axum::{
    Json,
    extract::FromRequestParts,
    http::{StatusCode, header::AUTHORIZATION, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::json;

use super::identity;
use crate::error::Error;
use crate::server::AppState;
use crate::types::SessionIdentity;
use crate::types::permission::ROLE_ADMIN;

/// Extractor that requires a valid bearer session.
pub struct RequireAuth(pub SessionIdentity);

/// Extractor that additionally requires the admin role.
pub struct RequireAdmin(pub SessionIdentity);

#[derive(Debug)]
pub enum AuthError {
    MissingAuth,
    InvalidScheme,
    InvalidToken,
    NotAdmin,
    InternalError,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidScheme => (StatusCode::UNAUTHORIZED, "Invalid authorization scheme"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
            AuthError::NotAdmin => (StatusCode::FORBIDDEN, "Admin access required"),
            AuthError::InternalError => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = json!({ "error": message });

        let mut response = (status, Json(body)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                "WWW-Authenticate",
                "Bearer realm=\"statix\"".parse().unwrap(),
            );
        }

        response
    }
}

impl FromRequestParts<Arc<AppState>> for RequireAuth {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let identity = extract_and_authenticate(parts, state)?;
        Ok(RequireAuth(identity))
    }
}

impl FromRequestParts<Arc<AppState>> for RequireAdmin {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let identity = extract_and_authenticate(parts, state)?;

        if !identity.has_role(ROLE_ADMIN) {
            return Err(AuthError::NotAdmin);
        }

        Ok(RequireAdmin(identity))
    }
}

fn extract_and_authenticate(
    parts: &Parts,
    state: &Arc<AppState>,
) -> Result<SessionIdentity, AuthError> {
    let bearer = bearer_from_header(
        parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok()),
    )?;

    identity::authenticate(state.store.as_ref(), &bearer).map_err(|e| match e {
        Error::Unauthorized => AuthError::InvalidToken,
        _ => AuthError::InternalError,
    })
}

fn bearer_from_header(auth_header: Option<&str>) -> Result<String, AuthError> {
    match auth_header {
        Some(header) => match header.strip_prefix("Bearer ") {
            Some(token) if !token.is_empty() => Ok(token.to_string()),
            Some(_) => Err(AuthError::InvalidToken),
            None => Err(AuthError::InvalidScheme),
        },
        None => Err(AuthError::MissingAuth),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_extraction() {
        assert_eq!(
            bearer_from_header(Some("Bearer abc123")).unwrap(),
            "abc123"
        );
        assert!(matches!(
            bearer_from_header(Some("Basic abc")),
            Err(AuthError::InvalidScheme)
        ));
        assert!(matches!(
            bearer_from_header(Some("Bearer ")),
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            bearer_from_header(None),
            Err(AuthError::MissingAuth)
        ));
    }
}

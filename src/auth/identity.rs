//! Authentication, session lifecycle, and user/role administration over the
//! store.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::token::{
    PasswordHasher, hash_token, mint_token, reset_expiry, session_expiry,
};
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::permission;
use crate::types::{AuthToken, AuthTokenKind, Role, RoleWithPermissions, Session, SessionIdentity, User, UserWithRoles};

pub const AUDIT_LOGIN_SUCCESS: &str = "login_success";
pub const AUDIT_LOGIN_FAILED: &str = "login_failed";
pub const AUDIT_ROLES_CHANGED: &str = "roles_changed";
pub const AUDIT_BOOTSTRAP_CLAIMED: &str = "bootstrap_claimed";

#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Seeds the reserved roles and the static permission codes, and grants every
/// static code to the admin role.
pub fn seed(store: &dyn Store) -> Result<()> {
    let admin = store.ensure_role(permission::ROLE_ADMIN, Some("Full administrative access"))?;
    store.ensure_role(permission::ROLE_USER, Some("Standard operator"))?;

    let mut admin_permission_ids = Vec::new();
    for (code, description) in permission::STATIC_PERMISSIONS {
        let p = store.ensure_permission(code, Some(description))?;
        admin_permission_ids.push(p.id);
    }
    store.replace_role_permissions(&admin.id, &admin_permission_ids)?;
    Ok(())
}

pub struct LoginOutcome {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub identity: SessionIdentity,
}

/// Verifies credentials and opens a session. Failure is deliberately opaque:
/// missing user, shell user, and wrong password all surface as `Unauthorized`.
pub fn login(
    store: &dyn Store,
    hasher: &PasswordHasher,
    email: &str,
    password: &str,
    ip: Option<&str>,
    user_agent: Option<&str>,
) -> Result<LoginOutcome> {
    let normalized = normalize_email(email);
    let Some(user) = store.find_user_by_email(&normalized)? else {
        return Err(Error::Unauthorized);
    };
    let Some(stored) = user.password_hash.as_deref() else {
        return Err(Error::Unauthorized);
    };

    if !hasher.verify(password, stored)? {
        store.record_login_failure(&user.id)?;
        if let Err(e) = store.append_audit(Some(&user.id), AUDIT_LOGIN_FAILED, ip, user_agent, None)
        {
            tracing::warn!("audit write failed: {e}");
        }
        return Err(Error::Unauthorized);
    }

    if user.is_disabled {
        return Err(Error::Forbidden);
    }

    let minted = mint_token();
    let now = Utc::now();
    let session = Session {
        id: Uuid::new_v4().to_string(),
        user_id: user.id.clone(),
        token_hash: minted.hash.clone(),
        created_at: now,
        expires_at: session_expiry(),
        revoked_at: None,
        last_seen_at: None,
        ip: ip.map(str::to_string),
        user_agent: user_agent.map(str::to_string),
    };
    store.create_session(&session)?;
    store.record_login_success(&user.id, ip)?;
    if let Err(e) = store.append_audit(Some(&user.id), AUDIT_LOGIN_SUCCESS, ip, user_agent, None) {
        tracing::warn!("audit write failed: {e}");
    }

    let identity = store
        .find_active_session_by_token_hash(&minted.hash)?
        .ok_or(Error::Unauthorized)?;

    Ok(LoginOutcome {
        token: minted.plaintext,
        expires_at: session.expires_at,
        identity,
    })
}

/// Resolves a presented bearer to its session identity and touches the
/// session's `last_seen_at`.
pub fn authenticate(store: &dyn Store, bearer: &str) -> Result<SessionIdentity> {
    let identity = store
        .find_active_session_by_token_hash(&hash_token(bearer))?
        .ok_or(Error::Unauthorized)?;

    if let Err(e) = store.touch_session(&identity.session_id) {
        tracing::warn!("failed to touch session: {e}");
    }
    Ok(identity)
}

/// Revokes the bearer's session. Idempotent; unknown bearers are a no-op.
pub fn logout(store: &dyn Store, bearer: &str) -> Result<()> {
    store.revoke_session_by_token_hash(&hash_token(bearer))
}

pub struct InvitedUser {
    pub user: User,
    pub setup_token: String,
    pub setup_token_expires_at: DateTime<Utc>,
}

/// Creates a shell user with the `user` role and a single-use setup token.
/// The setup plaintext is returned exactly once.
pub fn create_user(store: &dyn Store, email: &str, display_name: Option<&str>) -> Result<InvitedUser> {
    let email = email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(Error::BadRequest("a valid email is required".into()));
    }

    let now = Utc::now();
    let user = User {
        id: Uuid::new_v4().to_string(),
        email: email.to_string(),
        email_normalized: normalize_email(email),
        password_hash: None,
        email_verified_at: None,
        is_disabled: false,
        failed_login_count: 0,
        locked_until: None,
        last_login_at: None,
        last_login_ip: None,
        display_name: display_name.map(str::to_string),
        created_at: now,
        updated_at: now,
    };
    store.create_shell_user(&user)?;

    let role = store.ensure_role(permission::ROLE_USER, None)?;
    store.assign_role(&user.id, &role.id)?;

    let minted = mint_token();
    let token = AuthToken {
        id: Uuid::new_v4().to_string(),
        user_id: user.id.clone(),
        kind: AuthTokenKind::ResetPassword,
        token_hash: minted.hash,
        expires_at: reset_expiry(),
        consumed_at: None,
        metadata: None,
    };
    store.create_reset_token(&token)?;

    Ok(InvitedUser {
        user,
        setup_token: minted.plaintext,
        setup_token_expires_at: token.expires_at,
    })
}

/// Completes an invitation or reset: consumes the token and installs the new
/// password. Expired, consumed, and unknown tokens are indistinguishable.
pub fn set_password(
    store: &dyn Store,
    hasher: &PasswordHasher,
    token: &str,
    password: &str,
) -> Result<()> {
    if password.is_empty() {
        return Err(Error::BadRequest("password is required".into()));
    }

    let Some(reset) = store.find_usable_reset_token(&hash_token(token))? else {
        return Err(Error::Unauthorized);
    };

    let password_hash = hasher.hash(password)?;
    store.consume_token(&reset.id)?;
    store.update_password(&reset.user_id, &password_hash)?;
    Ok(())
}

/// Replaces a user's role set (set-equality semantics). Refuses to leave the
/// system without a credentialed admin.
pub fn replace_user_roles(
    store: &dyn Store,
    user_id: &str,
    role_names: &[String],
) -> Result<UserWithRoles> {
    if role_names.is_empty() {
        return Err(Error::Conflict("at least one role is required".into()));
    }

    let target = store.find_user_by_id(user_id)?.ok_or(Error::NotFound)?;

    let mut names: Vec<String> = role_names.to_vec();
    names.sort();
    names.dedup();

    let roles = store.find_roles_by_names(&names)?;
    if roles.len() != names.len() {
        let found: Vec<&str> = roles.iter().map(|r| r.name.as_str()).collect();
        let missing: Vec<&str> = names
            .iter()
            .map(String::as_str)
            .filter(|n| !found.contains(n))
            .collect();
        return Err(Error::Conflict(format!(
            "unknown role names: {}",
            missing.join(", ")
        )));
    }

    let current = store.user_roles(user_id)?;
    let is_credentialed_admin = target.password_hash.is_some()
        && current.iter().any(|r| r == permission::ROLE_ADMIN);
    let keeps_admin = names.iter().any(|n| n == permission::ROLE_ADMIN);
    if is_credentialed_admin
        && !keeps_admin
        && !store.has_credentialed_admin_excluding_email(&target.email_normalized)?
    {
        return Err(Error::Conflict(
            "cannot remove the last credentialed admin".into(),
        ));
    }

    let role_ids: Vec<String> = roles.iter().map(|r| r.id.clone()).collect();
    store.replace_user_roles(user_id, &role_ids)?;
    if let Err(e) = store.append_audit(
        Some(user_id),
        AUDIT_ROLES_CHANGED,
        None,
        None,
        Some(&names.join(",")),
    ) {
        tracing::warn!("audit write failed: {e}");
    }

    Ok(UserWithRoles {
        user: target,
        roles: names,
    })
}

/// Creates (or completes) a role and optionally sets its permission codes.
pub fn create_role(
    store: &dyn Store,
    name: &str,
    description: Option<&str>,
    permission_codes: &[String],
) -> Result<RoleWithPermissions> {
    if !permission::is_valid_role_name(name) {
        return Err(Error::BadRequest(format!("invalid role name: {name}")));
    }

    let role = store.ensure_role(name, description)?;
    if !permission_codes.is_empty() {
        let ids = resolve_permission_ids(store, permission_codes)?;
        store.replace_role_permissions(&role.id, &ids)?;
    }
    role_listing_entry(store, role)
}

/// Replaces a role's permission set by role name.
pub fn replace_role_permissions(
    store: &dyn Store,
    role_name: &str,
    permission_codes: &[String],
) -> Result<RoleWithPermissions> {
    let role = store.find_role_by_name(role_name)?.ok_or(Error::NotFound)?;
    let ids = resolve_permission_ids(store, permission_codes)?;
    store.replace_role_permissions(&role.id, &ids)?;
    role_listing_entry(store, role)
}

/// Static codes must be seeded already; per-node codes are provisioned on
/// first reference; anything else is rejected.
fn resolve_permission_ids(store: &dyn Store, codes: &[String]) -> Result<Vec<String>> {
    let mut ids = Vec::with_capacity(codes.len());
    for code in codes {
        if permission::is_static_code(code) || permission::is_dynamic_node_code(code) {
            ids.push(store.ensure_permission(code, None)?.id);
        } else {
            return Err(Error::Conflict(format!("unknown permission code: {code}")));
        }
    }
    Ok(ids)
}

fn role_listing_entry(store: &dyn Store, role: Role) -> Result<RoleWithPermissions> {
    let all = store.list_roles_with_permissions()?;
    all.into_iter()
        .find(|r| r.role.id == role.id)
        .ok_or(Error::NotFound)
}

//! First-admin bootstrap.
//!
//! Until one user with a password holds the admin role, the system is in the
//! pending state: a reserved shell admin row exists together with an active
//! reset token whose plaintext is surfaced through the startup log only.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use super::identity::{self, AUDIT_BOOTSTRAP_CLAIMED, normalize_email};
use super::token::{PasswordHasher, hash_token, mint_token, reset_expiry};
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::permission::ROLE_ADMIN;
use crate::types::{AuthToken, AuthTokenKind, User};

pub const BOOTSTRAP_ADMIN_EMAIL: &str = "admin@statix.local";

// Tags the reset token as the bootstrap one. The plaintext itself is never
// persisted; it leaves the process through the startup log only.
const METADATA_KEY: &str = "bootstrap";

pub fn needs_bootstrap(store: &dyn Store) -> Result<bool> {
    Ok(!store.has_credentialed_admin()?)
}

/// Server prestart. Seeds roles/permissions, then either purges the shell
/// admin (claimed state) or ensures it exists with an active bootstrap token
/// (pending state). Returns the token plaintext to surface in the log when
/// bootstrap is pending.
pub fn prestart(store: &dyn Store) -> Result<Option<String>> {
    identity::seed(store)?;

    if store.has_credentialed_admin_excluding_email(BOOTSTRAP_ADMIN_EMAIL)? {
        if let Some(shell) = store.find_user_by_email(BOOTSTRAP_ADMIN_EMAIL)? {
            if shell.is_shell() {
                store.delete_user(&shell.id)?;
            }
        }
        return Ok(None);
    }
    if store.has_credentialed_admin()? {
        // The claimed admin kept the reserved email; nothing to purge.
        return Ok(None);
    }

    let user = match store.find_user_by_email(BOOTSTRAP_ADMIN_EMAIL)? {
        Some(user) => user,
        None => {
            let now = Utc::now();
            let user = User {
                id: Uuid::new_v4().to_string(),
                email: BOOTSTRAP_ADMIN_EMAIL.to_string(),
                email_normalized: normalize_email(BOOTSTRAP_ADMIN_EMAIL),
                password_hash: None,
                email_verified_at: None,
                is_disabled: false,
                failed_login_count: 0,
                locked_until: None,
                last_login_at: None,
                last_login_ip: None,
                display_name: Some("Administrator".to_string()),
                created_at: now,
                updated_at: now,
            };
            store.create_shell_user(&user)?;
            user
        }
    };

    let admin = store.ensure_role(ROLE_ADMIN, None)?;
    store.assign_role(&user.id, &admin.id)?;

    if store.find_active_reset_token_by_user(&user.id)?.is_some() {
        // Still pending from a previous start. The plaintext was surfaced
        // when the token was minted; a fresh one is only issued once this
        // one expires.
        tracing::info!("bootstrap pending; an unexpired bootstrap token is outstanding");
        return Ok(None);
    }

    let minted = mint_token();
    let token = AuthToken {
        id: Uuid::new_v4().to_string(),
        user_id: user.id.clone(),
        kind: AuthTokenKind::ResetPassword,
        token_hash: minted.hash,
        expires_at: reset_expiry(),
        consumed_at: None,
        metadata: Some(json!({ METADATA_KEY: true })),
    };
    store.rotate_reset_token(&token)?;
    Ok(Some(minted.plaintext))
}

/// Converts the shell admin into a credentialed admin using the bootstrap
/// token. The token must target a shell user that holds the admin role.
pub fn claim(
    store: &dyn Store,
    hasher: &PasswordHasher,
    token: &str,
    email: &str,
    password: &str,
    display_name: Option<&str>,
) -> Result<()> {
    let email = email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(Error::BadRequest("a valid email is required".into()));
    }
    if password.is_empty() {
        return Err(Error::BadRequest("password is required".into()));
    }

    let Some(reset) = store.find_usable_reset_token(&hash_token(token))? else {
        return Err(Error::Unauthorized);
    };

    let user = store
        .find_user_by_id(&reset.user_id)?
        .ok_or(Error::Unauthorized)?;
    let roles = store.user_roles(&user.id)?;

    let tagged = reset
        .metadata
        .as_ref()
        .and_then(|m| m.get(METADATA_KEY))
        .is_some();
    if !tagged || user.password_hash.is_some() || !roles.iter().any(|r| r == ROLE_ADMIN) {
        return Err(Error::Forbidden);
    }

    let password_hash = hasher.hash(password)?;
    store.consume_token(&reset.id)?;
    store.update_profile_and_password(&user.id, email, display_name, &password_hash)?;
    if let Err(e) = store.append_audit(Some(&user.id), AUDIT_BOOTSTRAP_CLAIMED, None, None, None) {
        tracing::warn!("audit write failed: {e}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().expect("temp dir");
        let store = SqliteStore::new(dir.path().join("statix.db")).expect("open");
        store.initialize().expect("initialize");
        (dir, store)
    }

    #[test]
    fn test_prestart_mints_once_while_pending() {
        let (_dir, store) = open_store();

        let first = prestart(&store).expect("prestart");
        assert!(first.is_some());
        assert!(needs_bootstrap(&store).unwrap());

        // The outstanding token is reused, not rotated.
        let second = prestart(&store).expect("prestart again");
        assert!(second.is_none());
        assert!(needs_bootstrap(&store).unwrap());
    }

    #[test]
    fn test_claim_converts_shell_admin() {
        let (_dir, store) = open_store();
        let hasher = PasswordHasher::new();

        let token = prestart(&store).expect("prestart").expect("token");
        claim(&store, &hasher, &token, "a@a", "secret", Some("A")).expect("claim");

        assert!(!needs_bootstrap(&store).unwrap());

        // Single use.
        let err = claim(&store, &hasher, &token, "b@b", "other", None).unwrap_err();
        assert!(matches!(err, Error::Unauthorized));

        // Claimed state: prestart is a no-op.
        assert!(prestart(&store).expect("prestart after claim").is_none());
    }

    #[test]
    fn test_claim_rejects_wrong_token() {
        let (_dir, store) = open_store();
        let hasher = PasswordHasher::new();
        prestart(&store).expect("prestart");

        let err = claim(&store, &hasher, "not-the-token", "a@a", "p", None).unwrap_err();
        assert!(matches!(err, Error::Unauthorized));
        assert!(needs_bootstrap(&store).unwrap());
    }

    #[test]
    fn test_invite_token_is_not_eligible_for_claim() {
        let (_dir, store) = open_store();
        let hasher = PasswordHasher::new();
        let token = prestart(&store).expect("prestart").expect("token");
        claim(&store, &hasher, &token, "a@a", "secret", None).expect("claim");

        let invited = identity::create_user(&store, "op@example.com", None).expect("invite");
        let err = claim(&store, &hasher, &invited.setup_token, "x@x", "p", None).unwrap_err();
        assert!(matches!(err, Error::Forbidden));
    }

    #[test]
    fn test_prestart_purges_shell_after_external_admin_exists() {
        let (_dir, store) = open_store();
        let hasher = PasswordHasher::new();
        let token = prestart(&store).expect("prestart").expect("token");
        // Claim under a real email: the reserved row is renamed away.
        claim(&store, &hasher, &token, "a@a", "secret", None).expect("claim");
        assert!(
            store
                .find_user_by_email(BOOTSTRAP_ADMIN_EMAIL)
                .unwrap()
                .is_none()
        );

        prestart(&store).expect("prestart");
        // Claimed state: no shell row is recreated.
        assert!(
            store
                .find_user_by_email(BOOTSTRAP_ADMIN_EMAIL)
                .unwrap()
                .is_none()
        );
    }
}

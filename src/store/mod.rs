mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::types::*;

/// Store defines the database interface. Each operation is atomic with
/// respect to the invariants it touches.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;
    fn ping(&self) -> Result<()>;

    // Node operations
    fn create_node(&self, node: &Node) -> Result<()>;
    fn find_node(&self, id: &str) -> Result<Option<Node>>;
    fn delete_node(&self, id: &str) -> Result<bool>;
    fn update_node_name(&self, id: &str, name: Option<&str>) -> Result<bool>;
    fn list_nodes_with_stats(&self) -> Result<Vec<NodeWithStats>>;

    // Telemetry operations
    fn append_metric(&self, node_id: &str, payload: &MetricsPayload) -> Result<()>;
    fn list_recent_metrics(&self, node_id: &str, limit: i64) -> Result<Vec<Metric>>;
    /// Returns true when the stored inventory actually changed.
    fn upsert_system_info(&self, node_id: &str, payload: &SystemInfoPayload) -> Result<bool>;

    // User operations
    fn has_credentialed_admin(&self) -> Result<bool>;
    fn has_credentialed_admin_excluding_email(&self, email_normalized: &str) -> Result<bool>;
    fn find_user_by_email(&self, email_normalized: &str) -> Result<Option<User>>;
    fn find_user_by_id(&self, id: &str) -> Result<Option<User>>;
    fn create_shell_user(&self, user: &User) -> Result<()>;
    fn update_profile_and_password(
        &self,
        user_id: &str,
        email: &str,
        display_name: Option<&str>,
        password_hash: &str,
    ) -> Result<()>;
    fn update_password(&self, user_id: &str, password_hash: &str) -> Result<()>;
    fn record_login_success(&self, user_id: &str, ip: Option<&str>) -> Result<()>;
    fn record_login_failure(&self, user_id: &str) -> Result<()>;
    fn delete_user(&self, id: &str) -> Result<bool>;
    fn list_users_with_roles(&self) -> Result<Vec<UserWithRoles>>;
    fn user_roles(&self, user_id: &str) -> Result<Vec<String>>;

    // Role and permission operations
    fn ensure_role(&self, name: &str, description: Option<&str>) -> Result<Role>;
    fn find_role_by_name(&self, name: &str) -> Result<Option<Role>>;
    fn find_roles_by_names(&self, names: &[String]) -> Result<Vec<Role>>;
    fn assign_role(&self, user_id: &str, role_id: &str) -> Result<()>;
    fn replace_user_roles(&self, user_id: &str, role_ids: &[String]) -> Result<()>;
    fn list_roles_with_permissions(&self) -> Result<Vec<RoleWithPermissions>>;
    fn list_permissions(&self) -> Result<Vec<Permission>>;
    fn ensure_permission(&self, code: &str, description: Option<&str>) -> Result<Permission>;
    fn replace_role_permissions(&self, role_id: &str, permission_ids: &[String]) -> Result<()>;

    // Setup/reset token operations
    fn create_reset_token(&self, token: &AuthToken) -> Result<()>;
    /// Deletes any outstanding unconsumed reset token for the same user,
    /// then inserts, in one transaction.
    fn rotate_reset_token(&self, token: &AuthToken) -> Result<()>;
    fn find_usable_reset_token(&self, token_hash: &str) -> Result<Option<AuthToken>>;
    fn consume_token(&self, id: &str) -> Result<()>;
    fn find_active_reset_token_by_user(&self, user_id: &str) -> Result<Option<AuthToken>>;

    // Session operations
    fn create_session(&self, session: &Session) -> Result<()>;
    fn find_active_session_by_token_hash(&self, token_hash: &str)
        -> Result<Option<SessionIdentity>>;
    fn touch_session(&self, id: &str) -> Result<()>;
    fn revoke_session_by_token_hash(&self, token_hash: &str) -> Result<()>;

    // Audit log
    fn append_audit(
        &self,
        user_id: Option<&str>,
        action: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
        details: Option<&str>,
    ) -> Result<()>;
}

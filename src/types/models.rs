use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip)]
    pub auth_token_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub id: i64,
    pub node_id: String,
    pub created_at: DateTime<Utc>,
    /// Agent-provided sample time, epoch milliseconds. Retained alongside
    /// `created_at` because agent clock skew is allowed.
    pub ts: i64,
    pub cpu: f64,
    pub mem_used: i64,
    pub mem_total: i64,
    pub disk_used: i64,
    pub disk_total: i64,
    pub net_rx: i64,
    pub net_tx: i64,
}

/// Numeric fields of the newest metric row, as embedded in the roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestMetric {
    pub ts: i64,
    pub cpu: f64,
    pub mem_used: i64,
    pub mem_total: i64,
    pub disk_used: i64,
    pub disk_total: i64,
    pub net_rx: i64,
    pub net_tx: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfoSummary {
    pub hash: String,
    pub reported_ts: i64,
    pub info: serde_json::Value,
}

/// One roster entry: node identity plus aggregated publish stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeWithStats {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub publish_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_publish_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_metric: Option<LatestMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_info: Option<SystemInfoSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(skip)]
    pub email_normalized: String,
    #[serde(skip)]
    pub password_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified_at: Option<DateTime<Utc>>,
    pub is_disabled: bool,
    #[serde(skip)]
    pub failed_login_count: i64,
    #[serde(skip)]
    pub locked_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub last_login_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// A shell user is awaiting setup: it has no password yet.
    #[must_use]
    pub fn is_shell(&self) -> bool {
        self.password_hash.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserWithRoles {
    #[serde(flatten)]
    pub user: User,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleWithPermissions {
    #[serde(flatten)]
    pub role: Role,
    pub permissions: Vec<String>,
    pub users_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub id: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub user_id: String,
    #[serde(skip)]
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// The resolved identity behind an active session: the user plus the
/// flattened role names and the sorted union of permission codes.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub session_id: String,
    pub user: User,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

impl SessionIdentity {
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    #[must_use]
    pub fn can(&self, code: &str) -> bool {
        self.permissions.iter().any(|c| c == code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthTokenKind {
    VerifyEmail,
    ResetPassword,
    ChangeEmail,
}

impl AuthTokenKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AuthTokenKind::VerifyEmail => "verify_email",
            AuthTokenKind::ResetPassword => "reset_password",
            AuthTokenKind::ChangeEmail => "change_email",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "verify_email" => Some(AuthTokenKind::VerifyEmail),
            "reset_password" => Some(AuthTokenKind::ResetPassword),
            "change_email" => Some(AuthTokenKind::ChangeEmail),
            _ => None,
        }
    }
}

/// A single-use setup/reset token row. Only the hash of the bearer is kept.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub id: String,
    pub user_id: String,
    pub kind: AuthTokenKind,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

/// Broker coordinates handed to an agent by the exchange endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub expires_at: Option<DateTime<Utc>>,
}

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::Store;
use super::schema::SCHEMA;
use crate::error::{Error, Result};
use crate::types::*;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn opt_datetime(value: Option<String>) -> Option<DateTime<Utc>> {
    value.map(|s| parse_datetime(&s))
}

/// Epoch-ms sample time converted for the `last_seen_at` column.
fn sample_time(ts_ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts_ms).unwrap_or_else(Utc::now)
}

fn map_constraint(e: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(f, _) = &e {
        if f.code == rusqlite::ErrorCode::ConstraintViolation {
            return Error::AlreadyExists;
        }
    }
    Error::Database(e)
}

fn node_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: row.get(0)?,
        name: row.get(1)?,
        auth_token_hash: row.get(2)?,
        last_seen_at: opt_datetime(row.get(3)?),
        created_at: parse_datetime(&row.get::<_, String>(4)?),
        updated_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

const USER_COLUMNS: &str = "id, email, email_normalized, password_hash, email_verified_at, \
     is_disabled, failed_login_count, locked_until, last_login_at, last_login_ip, \
     display_name, created_at, updated_at";

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        email_normalized: row.get(2)?,
        password_hash: row.get(3)?,
        email_verified_at: opt_datetime(row.get(4)?),
        is_disabled: row.get(5)?,
        failed_login_count: row.get(6)?,
        locked_until: opt_datetime(row.get(7)?),
        last_login_at: opt_datetime(row.get(8)?),
        last_login_ip: row.get(9)?,
        display_name: row.get(10)?,
        created_at: parse_datetime(&row.get::<_, String>(11)?),
        updated_at: parse_datetime(&row.get::<_, String>(12)?),
    })
}

fn metric_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Metric> {
    Ok(Metric {
        id: row.get(0)?,
        node_id: row.get(1)?,
        created_at: parse_datetime(&row.get::<_, String>(2)?),
        ts: row.get(3)?,
        cpu: row.get(4)?,
        mem_used: row.get(5)?,
        mem_total: row.get(6)?,
        disk_used: row.get(7)?,
        disk_total: row.get(8)?,
        net_rx: row.get(9)?,
        net_tx: row.get(10)?,
    })
}

fn auth_token_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuthToken> {
    let kind: String = row.get(2)?;
    let metadata: Option<String> = row.get(6)?;
    Ok(AuthToken {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: AuthTokenKind::parse(&kind).unwrap_or(AuthTokenKind::ResetPassword),
        token_hash: row.get(3)?,
        expires_at: parse_datetime(&row.get::<_, String>(4)?),
        consumed_at: opt_datetime(row.get(5)?),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
    })
}

fn roles_of(conn: &Connection, user_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT r.name FROM user_roles ur
         JOIN roles r ON r.id = ur.role_id
         WHERE ur.user_id = ?1 ORDER BY r.name",
    )?;
    let rows = stmt.query_map(params![user_id], |row| row.get(0))?;
    rows.collect()
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        self.conn()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    // Node operations

    fn create_node(&self, node: &Node) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO nodes (id, name, auth_token_hash, last_seen_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    node.id,
                    node.name,
                    node.auth_token_hash,
                    node.last_seen_at.as_ref().map(format_datetime),
                    format_datetime(&node.created_at),
                    format_datetime(&node.updated_at),
                ],
            )
            .map_err(map_constraint)?;
        Ok(())
    }

    fn find_node(&self, id: &str) -> Result<Option<Node>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, name, auth_token_hash, last_seen_at, created_at, updated_at
             FROM nodes WHERE id = ?1",
            params![id],
            node_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn delete_node(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM nodes WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn update_node_name(&self, id: &str, name: Option<&str>) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE nodes SET name = ?1, updated_at = ?2 WHERE id = ?3",
            params![name, format_datetime(&Utc::now()), id],
        )?;
        Ok(rows > 0)
    }

    fn list_nodes_with_stats(&self) -> Result<Vec<NodeWithStats>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, auth_token_hash, last_seen_at, created_at, updated_at
             FROM nodes ORDER BY created_at DESC",
        )?;
        let nodes = stmt
            .query_map([], node_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            let publish_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM metrics WHERE node_id = ?1",
                params![node.id],
                |row| row.get(0),
            )?;

            let latest = conn
                .query_row(
                    "SELECT created_at, ts, cpu, mem_used, mem_total, disk_used, disk_total,
                            net_rx, net_tx
                     FROM metrics WHERE node_id = ?1 ORDER BY id DESC LIMIT 1",
                    params![node.id],
                    |row| {
                        Ok((
                            parse_datetime(&row.get::<_, String>(0)?),
                            LatestMetric {
                                ts: row.get(1)?,
                                cpu: row.get(2)?,
                                mem_used: row.get(3)?,
                                mem_total: row.get(4)?,
                                disk_used: row.get(5)?,
                                disk_total: row.get(6)?,
                                net_rx: row.get(7)?,
                                net_tx: row.get(8)?,
                            },
                        ))
                    },
                )
                .optional()?;

            let system_info = conn
                .query_row(
                    "SELECT hash, payload, reported_ts FROM node_system_info WHERE node_id = ?1",
                    params![node.id],
                    |row| {
                        let payload: String = row.get(1)?;
                        Ok(SystemInfoSummary {
                            hash: row.get(0)?,
                            reported_ts: row.get(2)?,
                            info: serde_json::from_str(&payload)
                                .unwrap_or(serde_json::Value::Null),
                        })
                    },
                )
                .optional()?;

            let (last_publish_at, latest_metric) = match latest {
                Some((at, m)) => (Some(at), Some(m)),
                None => (None, None),
            };

            out.push(NodeWithStats {
                id: node.id,
                name: node.name,
                last_seen_at: node.last_seen_at,
                created_at: node.created_at,
                updated_at: node.updated_at,
                publish_count,
                last_publish_at,
                latest_metric,
                system_info,
            });
        }
        Ok(out)
    }

    // Telemetry operations

    fn append_metric(&self, node_id: &str, payload: &MetricsPayload) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM nodes WHERE id = ?1",
                params![node_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(Error::NotFound);
        }

        tx.execute(
            "INSERT INTO metrics (node_id, created_at, ts, cpu, mem_used, mem_total,
                                  disk_used, disk_total, net_rx, net_tx)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                node_id,
                format_datetime(&Utc::now()),
                payload.ts,
                payload.cpu,
                payload.mem_used,
                payload.mem_total,
                payload.disk_used,
                payload.disk_total,
                payload.net_rx,
                payload.net_tx,
            ],
        )?;
        tx.execute(
            "UPDATE nodes SET last_seen_at = ?1 WHERE id = ?2",
            params![format_datetime(&sample_time(payload.ts)), node_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn list_recent_metrics(&self, node_id: &str, limit: i64) -> Result<Vec<Metric>> {
        let limit = limit.clamp(1, 300);
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, node_id, created_at, ts, cpu, mem_used, mem_total,
                    disk_used, disk_total, net_rx, net_tx
             FROM metrics WHERE node_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let mut rows = stmt
            .query_map(params![node_id, limit], metric_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    fn upsert_system_info(&self, node_id: &str, payload: &SystemInfoPayload) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM nodes WHERE id = ?1",
                params![node_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(Error::NotFound);
        }

        let stored_hash: Option<String> = tx
            .query_row(
                "SELECT hash FROM node_system_info WHERE node_id = ?1",
                params![node_id],
                |row| row.get(0),
            )
            .optional()?;

        let last_seen = format_datetime(&sample_time(payload.ts));
        let changed = stored_hash.as_deref() != Some(payload.hash.as_str());

        if changed {
            tx.execute(
                "INSERT INTO node_system_info (node_id, hash, payload, reported_ts, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(node_id) DO UPDATE SET
                     hash = excluded.hash,
                     payload = excluded.payload,
                     reported_ts = excluded.reported_ts,
                     updated_at = excluded.updated_at",
                params![
                    node_id,
                    payload.hash,
                    serde_json::to_string(&payload.info)?,
                    payload.ts,
                    format_datetime(&Utc::now()),
                ],
            )?;
        }
        tx.execute(
            "UPDATE nodes SET last_seen_at = ?1 WHERE id = ?2",
            params![last_seen, node_id],
        )?;

        tx.commit()?;
        Ok(changed)
    }

    // User operations

    fn has_credentialed_admin(&self) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM users u
             JOIN user_roles ur ON ur.user_id = u.id
             JOIN roles r ON r.id = ur.role_id
             WHERE u.password_hash IS NOT NULL AND r.name = 'admin'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn has_credentialed_admin_excluding_email(&self, email_normalized: &str) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM users u
             JOIN user_roles ur ON ur.user_id = u.id
             JOIN roles r ON r.id = ur.role_id
             WHERE u.password_hash IS NOT NULL AND r.name = 'admin'
               AND u.email_normalized != ?1",
            params![email_normalized],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn find_user_by_email(&self, email_normalized: &str) -> Result<Option<User>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE email_normalized = ?1"),
            params![email_normalized],
            user_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn find_user_by_id(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![id],
            user_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn create_shell_user(&self, user: &User) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO users (id, email, email_normalized, password_hash, is_disabled,
                                    failed_login_count, display_name, created_at, updated_at)
                 VALUES (?1, ?2, ?3, NULL, 0, 0, ?4, ?5, ?6)",
                params![
                    user.id,
                    user.email,
                    user.email_normalized,
                    user.display_name,
                    format_datetime(&user.created_at),
                    format_datetime(&user.updated_at),
                ],
            )
            .map_err(map_constraint)?;
        Ok(())
    }

    fn update_profile_and_password(
        &self,
        user_id: &str,
        email: &str,
        display_name: Option<&str>,
        password_hash: &str,
    ) -> Result<()> {
        let now = format_datetime(&Utc::now());
        let rows = self
            .conn()
            .execute(
                "UPDATE users SET email = ?1, email_normalized = ?2, display_name = ?3,
                        password_hash = ?4, email_verified_at = ?5, failed_login_count = 0,
                        locked_until = NULL, updated_at = ?5
                 WHERE id = ?6",
                params![
                    email,
                    email.trim().to_lowercase(),
                    display_name,
                    password_hash,
                    now,
                    user_id,
                ],
            )
            .map_err(map_constraint)?;
        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn update_password(&self, user_id: &str, password_hash: &str) -> Result<()> {
        let now = format_datetime(&Utc::now());
        let rows = self.conn().execute(
            "UPDATE users SET password_hash = ?1, email_verified_at = ?2,
                    failed_login_count = 0, locked_until = NULL, updated_at = ?2
             WHERE id = ?3",
            params![password_hash, now, user_id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn record_login_success(&self, user_id: &str, ip: Option<&str>) -> Result<()> {
        let now = format_datetime(&Utc::now());
        self.conn().execute(
            "UPDATE users SET failed_login_count = 0, locked_until = NULL,
                    last_login_at = ?1, last_login_ip = ?2, updated_at = ?1
             WHERE id = ?3",
            params![now, ip, user_id],
        )?;
        Ok(())
    }

    fn record_login_failure(&self, user_id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE users SET failed_login_count = failed_login_count + 1, updated_at = ?1
             WHERE id = ?2",
            params![format_datetime(&Utc::now()), user_id],
        )?;
        Ok(())
    }

    fn delete_user(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM users WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn list_users_with_roles(&self) -> Result<Vec<UserWithRoles>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY created_at"))?;
        let users = stmt
            .query_map([], user_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(users.len());
        for user in users {
            let roles = roles_of(&conn, &user.id)?;
            out.push(UserWithRoles { user, roles });
        }
        Ok(out)
    }

    fn user_roles(&self, user_id: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        roles_of(&conn, user_id).map_err(Error::from)
    }

    // Role and permission operations

    fn ensure_role(&self, name: &str, description: Option<&str>) -> Result<Role> {
        let conn = self.conn();
        let existing = conn
            .query_row(
                "SELECT id, name, description FROM roles WHERE name = ?1",
                params![name],
                |row| {
                    Ok(Role {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                    })
                },
            )
            .optional()?;
        if let Some(role) = existing {
            return Ok(role);
        }

        let role = Role {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
        };
        conn.execute(
            "INSERT INTO roles (id, name, description) VALUES (?1, ?2, ?3)",
            params![role.id, role.name, role.description],
        )
        .map_err(map_constraint)?;
        Ok(role)
    }

    fn find_role_by_name(&self, name: &str) -> Result<Option<Role>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, name, description FROM roles WHERE name = ?1",
            params![name],
            |row| {
                Ok(Role {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    fn find_roles_by_names(&self, names: &[String]) -> Result<Vec<Role>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, name, description FROM roles WHERE name = ?1")?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let role = stmt
                .query_row(params![name], |row| {
                    Ok(Role {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                    })
                })
                .optional()?;
            if let Some(role) = role {
                out.push(role);
            }
        }
        Ok(out)
    }

    fn assign_role(&self, user_id: &str, role_id: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO user_roles (user_id, role_id) VALUES (?1, ?2)",
            params![user_id, role_id],
        )?;
        Ok(())
    }

    fn replace_user_roles(&self, user_id: &str, role_ids: &[String]) -> Result<()> {
        if role_ids.is_empty() {
            return Err(Error::Conflict("at least one role is required".into()));
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM user_roles WHERE user_id = ?1",
            params![user_id],
        )?;
        for role_id in role_ids {
            tx.execute(
                "INSERT OR IGNORE INTO user_roles (user_id, role_id) VALUES (?1, ?2)",
                params![user_id, role_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn list_roles_with_permissions(&self) -> Result<Vec<RoleWithPermissions>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, name, description FROM roles ORDER BY name")?;
        let roles = stmt
            .query_map([], |row| {
                Ok(Role {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(roles.len());
        for role in roles {
            let mut stmt = conn.prepare(
                "SELECT p.code FROM role_permissions rp
                 JOIN permissions p ON p.id = rp.permission_id
                 WHERE rp.role_id = ?1 ORDER BY p.code",
            )?;
            let permissions = stmt
                .query_map(params![role.id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            let users_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM user_roles WHERE role_id = ?1",
                params![role.id],
                |row| row.get(0),
            )?;
            out.push(RoleWithPermissions {
                role,
                permissions,
                users_count,
            });
        }
        Ok(out)
    }

    fn list_permissions(&self) -> Result<Vec<Permission>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, code, description FROM permissions ORDER BY code")?;
        let rows = stmt.query_map([], |row| {
            Ok(Permission {
                id: row.get(0)?,
                code: row.get(1)?,
                description: row.get(2)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn ensure_permission(&self, code: &str, description: Option<&str>) -> Result<Permission> {
        let conn = self.conn();
        let existing = conn
            .query_row(
                "SELECT id, code, description FROM permissions WHERE code = ?1",
                params![code],
                |row| {
                    Ok(Permission {
                        id: row.get(0)?,
                        code: row.get(1)?,
                        description: row.get(2)?,
                    })
                },
            )
            .optional()?;
        if let Some(permission) = existing {
            return Ok(permission);
        }

        let permission = Permission {
            id: Uuid::new_v4().to_string(),
            code: code.to_string(),
            description: description.map(str::to_string),
        };
        conn.execute(
            "INSERT INTO permissions (id, code, description) VALUES (?1, ?2, ?3)",
            params![permission.id, permission.code, permission.description],
        )
        .map_err(map_constraint)?;
        Ok(permission)
    }

    fn replace_role_permissions(&self, role_id: &str, permission_ids: &[String]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM role_permissions WHERE role_id = ?1",
            params![role_id],
        )?;
        for permission_id in permission_ids {
            tx.execute(
                "INSERT OR IGNORE INTO role_permissions (role_id, permission_id) VALUES (?1, ?2)",
                params![role_id, permission_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // Setup/reset token operations

    fn create_reset_token(&self, token: &AuthToken) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO auth_tokens (id, user_id, kind, token_hash, expires_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    token.id,
                    token.user_id,
                    token.kind.as_str(),
                    token.token_hash,
                    format_datetime(&token.expires_at),
                    token
                        .metadata
                        .as_ref()
                        .map(|m| serde_json::to_string(m).unwrap_or_default()),
                ],
            )
            .map_err(map_constraint)?;
        Ok(())
    }

    fn rotate_reset_token(&self, token: &AuthToken) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM auth_tokens
             WHERE user_id = ?1 AND kind = 'reset_password' AND consumed_at IS NULL",
            params![token.user_id],
        )?;
        tx.execute(
            "INSERT INTO auth_tokens (id, user_id, kind, token_hash, expires_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                token.id,
                token.user_id,
                token.kind.as_str(),
                token.token_hash,
                format_datetime(&token.expires_at),
                token
                    .metadata
                    .as_ref()
                    .map(|m| serde_json::to_string(m).unwrap_or_default()),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn find_usable_reset_token(&self, token_hash: &str) -> Result<Option<AuthToken>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, user_id, kind, token_hash, expires_at, consumed_at, metadata
             FROM auth_tokens
             WHERE token_hash = ?1 AND consumed_at IS NULL AND expires_at > ?2",
            params![token_hash, format_datetime(&Utc::now())],
            auth_token_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn consume_token(&self, id: &str) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE auth_tokens SET consumed_at = ?1 WHERE id = ?2 AND consumed_at IS NULL",
            params![format_datetime(&Utc::now()), id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn find_active_reset_token_by_user(&self, user_id: &str) -> Result<Option<AuthToken>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, user_id, kind, token_hash, expires_at, consumed_at, metadata
             FROM auth_tokens
             WHERE user_id = ?1 AND kind = 'reset_password'
               AND consumed_at IS NULL AND expires_at > ?2
             ORDER BY expires_at DESC LIMIT 1",
            params![user_id, format_datetime(&Utc::now())],
            auth_token_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    // Session operations

    fn create_session(&self, session: &Session) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO sessions (id, user_id, token_hash, created_at, expires_at, ip, user_agent)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    session.id,
                    session.user_id,
                    session.token_hash,
                    format_datetime(&session.created_at),
                    format_datetime(&session.expires_at),
                    session.ip,
                    session.user_agent,
                ],
            )
            .map_err(map_constraint)?;
        Ok(())
    }

    fn find_active_session_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<SessionIdentity>> {
        let conn = self.conn();
        let found = conn
            .query_row(
                "SELECT s.id, u.id, u.email, u.email_normalized, u.password_hash,
                        u.email_verified_at, u.is_disabled, u.failed_login_count,
                        u.locked_until, u.last_login_at, u.last_login_ip,
                        u.display_name, u.created_at, u.updated_at
                 FROM sessions s
                 JOIN users u ON u.id = s.user_id
                 WHERE s.token_hash = ?1 AND s.revoked_at IS NULL AND s.expires_at > ?2",
                params![token_hash, format_datetime(&Utc::now())],
                |row| {
                    let session_id: String = row.get(0)?;
                    let user = User {
                        id: row.get(1)?,
                        email: row.get(2)?,
                        email_normalized: row.get(3)?,
                        password_hash: row.get(4)?,
                        email_verified_at: opt_datetime(row.get(5)?),
                        is_disabled: row.get(6)?,
                        failed_login_count: row.get(7)?,
                        locked_until: opt_datetime(row.get(8)?),
                        last_login_at: opt_datetime(row.get(9)?),
                        last_login_ip: row.get(10)?,
                        display_name: row.get(11)?,
                        created_at: parse_datetime(&row.get::<_, String>(12)?),
                        updated_at: parse_datetime(&row.get::<_, String>(13)?),
                    };
                    Ok((session_id, user))
                },
            )
            .optional()?;

        let Some((session_id, user)) = found else {
            return Ok(None);
        };

        let roles = roles_of(&conn, &user.id)?;

        let mut stmt = conn.prepare(
            "SELECT DISTINCT p.code FROM user_roles ur
             JOIN role_permissions rp ON rp.role_id = ur.role_id
             JOIN permissions p ON p.id = rp.permission_id
             WHERE ur.user_id = ?1 ORDER BY p.code",
        )?;
        let permissions = stmt
            .query_map(params![user.id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;

        Ok(Some(SessionIdentity {
            session_id,
            user,
            roles,
            permissions,
        }))
    }

    fn touch_session(&self, id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE sessions SET last_seen_at = ?1 WHERE id = ?2",
            params![format_datetime(&Utc::now()), id],
        )?;
        Ok(())
    }

    fn revoke_session_by_token_hash(&self, token_hash: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE sessions SET revoked_at = ?1 WHERE token_hash = ?2 AND revoked_at IS NULL",
            params![format_datetime(&Utc::now()), token_hash],
        )?;
        Ok(())
    }

    // Audit log

    fn append_audit(
        &self,
        user_id: Option<&str>,
        action: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
        details: Option<&str>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO audit_log (user_id, action, ip, user_agent, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                action,
                ip,
                user_agent,
                details,
                format_datetime(&Utc::now()),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().expect("temp dir");
        let store = SqliteStore::new(dir.path().join("statix.db")).expect("open");
        store.initialize().expect("initialize");
        (dir, store)
    }

    fn insert_node(store: &SqliteStore, id: &str) -> Node {
        let now = Utc::now();
        let node = Node {
            id: id.to_string(),
            name: Some(format!("node-{id}")),
            auth_token_hash: Some(format!("hash-{id}")),
            last_seen_at: None,
            created_at: now,
            updated_at: now,
        };
        store.create_node(&node).expect("create node");
        node
    }

    fn metrics_payload(ts: i64) -> MetricsPayload {
        MetricsPayload {
            v: 1,
            ts,
            cpu: 0.25,
            mem_used: 512,
            mem_total: 1024,
            disk_used: 10,
            disk_total: 100,
            net_rx: 1,
            net_tx: 2,
        }
    }

    fn system_payload(hash: &str, ts: i64) -> SystemInfoPayload {
        SystemInfoPayload {
            v: 1,
            ts,
            hash: hash.to_string(),
            info: SystemInventory {
                os_platform: "linux".into(),
                os_release: "6.1".into(),
                os_arch: "x86_64".into(),
                hostname: "edge-1".into(),
                cpu_model: "test-cpu".into(),
                cpu_cores: 4,
                mem_total: 1024,
                agent_version: None,
                agent_commit: None,
                agent_built_at: None,
                gpus: vec![],
            },
        }
    }

    #[test]
    fn test_append_metric_advances_last_seen() {
        let (_dir, store) = open_store();
        insert_node(&store, "n1");

        store
            .append_metric("n1", &metrics_payload(1_700_000_000_000))
            .unwrap();

        let node = store.find_node("n1").unwrap().unwrap();
        assert_eq!(
            node.last_seen_at.unwrap().timestamp_millis(),
            1_700_000_000_000
        );

        let rows = store.list_recent_metrics("n1", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cpu, 0.25);
    }

    #[test]
    fn test_append_metric_unknown_node_is_not_found() {
        let (_dir, store) = open_store();
        let err = store
            .append_metric("missing", &metrics_payload(1))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn test_list_recent_metrics_clamps_and_reverses() {
        let (_dir, store) = open_store();
        insert_node(&store, "n1");
        for i in 0..5 {
            store
                .append_metric("n1", &metrics_payload(1_000 + i))
                .unwrap();
        }

        let rows = store.list_recent_metrics("n1", 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ts, 1_004);

        let rows = store.list_recent_metrics("n1", 10_000).unwrap();
        assert_eq!(rows.len(), 5);
        // Oldest first after the reversal.
        assert_eq!(rows[0].ts, 1_000);
        assert_eq!(rows[4].ts, 1_004);
    }

    #[test]
    fn test_upsert_system_info_idempotent_on_same_hash() {
        let (_dir, store) = open_store();
        insert_node(&store, "n1");

        let changed = store
            .upsert_system_info("n1", &system_payload("aaa", 1_000))
            .unwrap();
        assert!(changed);

        let changed = store
            .upsert_system_info("n1", &system_payload("aaa", 2_000))
            .unwrap();
        assert!(!changed);

        // last_seen_at still advances on the unchanged path.
        let node = store.find_node("n1").unwrap().unwrap();
        assert_eq!(node.last_seen_at.unwrap().timestamp_millis(), 2_000);

        let changed = store
            .upsert_system_info("n1", &system_payload("bbb", 3_000))
            .unwrap();
        assert!(changed);
    }

    #[test]
    fn test_delete_node_cascades_to_metrics_and_info() {
        let (_dir, store) = open_store();
        insert_node(&store, "n1");
        store.append_metric("n1", &metrics_payload(1_000)).unwrap();
        store
            .upsert_system_info("n1", &system_payload("aaa", 1_000))
            .unwrap();

        assert!(store.delete_node("n1").unwrap());
        assert!(store.find_node("n1").unwrap().is_none());
        assert!(store.list_recent_metrics("n1", 10).unwrap().is_empty());

        let stats = store.list_nodes_with_stats().unwrap();
        assert!(stats.is_empty());
    }

    #[test]
    fn test_list_nodes_with_stats_aggregates() {
        let (_dir, store) = open_store();
        insert_node(&store, "n1");
        insert_node(&store, "n2");
        store.append_metric("n1", &metrics_payload(1_000)).unwrap();
        store.append_metric("n1", &metrics_payload(2_000)).unwrap();
        store
            .upsert_system_info("n1", &system_payload("aaa", 2_000))
            .unwrap();

        let stats = store.list_nodes_with_stats().unwrap();
        assert_eq!(stats.len(), 2);
        let n1 = stats.iter().find(|n| n.id == "n1").unwrap();
        assert_eq!(n1.publish_count, 2);
        assert_eq!(n1.latest_metric.as_ref().unwrap().ts, 2_000);
        assert_eq!(n1.system_info.as_ref().unwrap().hash, "aaa");
        let n2 = stats.iter().find(|n| n.id == "n2").unwrap();
        assert_eq!(n2.publish_count, 0);
        assert!(n2.latest_metric.is_none());
    }

    fn shell_user(id: &str, email: &str) -> User {
        let now = Utc::now();
        User {
            id: id.to_string(),
            email: email.to_string(),
            email_normalized: email.trim().to_lowercase(),
            password_hash: None,
            email_verified_at: None,
            is_disabled: false,
            failed_login_count: 0,
            locked_until: None,
            last_login_at: None,
            last_login_ip: None,
            display_name: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_duplicate_email_is_already_exists() {
        let (_dir, store) = open_store();
        store.create_shell_user(&shell_user("u1", "a@a")).unwrap();
        let err = store
            .create_shell_user(&shell_user("u2", "a@a"))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));
    }

    #[test]
    fn test_credentialed_admin_detection() {
        let (_dir, store) = open_store();
        let admin_role = store.ensure_role("admin", None).unwrap();
        store.create_shell_user(&shell_user("u1", "a@a")).unwrap();
        store.assign_role("u1", &admin_role.id).unwrap();

        // Shell admin has no password yet.
        assert!(!store.has_credentialed_admin().unwrap());

        store.update_password("u1", "$argon2id$fake").unwrap();
        assert!(store.has_credentialed_admin().unwrap());
        assert!(
            !store
                .has_credentialed_admin_excluding_email("a@a")
                .unwrap()
        );
    }

    #[test]
    fn test_replace_user_roles_set_semantics() {
        let (_dir, store) = open_store();
        let r1 = store.ensure_role("admin", None).unwrap();
        let r2 = store.ensure_role("user", None).unwrap();
        store.create_shell_user(&shell_user("u1", "a@a")).unwrap();

        let ids = vec![r1.id.clone(), r2.id.clone()];
        store.replace_user_roles("u1", &ids).unwrap();
        store.replace_user_roles("u1", &ids).unwrap();
        assert_eq!(store.user_roles("u1").unwrap(), vec!["admin", "user"]);

        store.replace_user_roles("u1", &[r2.id.clone()]).unwrap();
        assert_eq!(store.user_roles("u1").unwrap(), vec!["user"]);

        let err = store.replace_user_roles("u1", &[]).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_rotate_reset_token_keeps_single_active() {
        let (_dir, store) = open_store();
        store.create_shell_user(&shell_user("u1", "a@a")).unwrap();

        let token = |id: &str, hash: &str| AuthToken {
            id: id.to_string(),
            user_id: "u1".to_string(),
            kind: AuthTokenKind::ResetPassword,
            token_hash: hash.to_string(),
            expires_at: Utc::now() + Duration::hours(1),
            consumed_at: None,
            metadata: None,
        };

        store.create_reset_token(&token("t1", "h1")).unwrap();
        store.rotate_reset_token(&token("t2", "h2")).unwrap();

        assert!(store.find_usable_reset_token("h1").unwrap().is_none());
        let active = store.find_usable_reset_token("h2").unwrap().unwrap();
        assert_eq!(active.id, "t2");

        let by_user = store.find_active_reset_token_by_user("u1").unwrap().unwrap();
        assert_eq!(by_user.id, "t2");
    }

    #[test]
    fn test_consume_token_is_single_use() {
        let (_dir, store) = open_store();
        store.create_shell_user(&shell_user("u1", "a@a")).unwrap();
        store
            .create_reset_token(&AuthToken {
                id: "t1".into(),
                user_id: "u1".into(),
                kind: AuthTokenKind::ResetPassword,
                token_hash: "h1".into(),
                expires_at: Utc::now() + Duration::hours(1),
                consumed_at: None,
                metadata: None,
            })
            .unwrap();

        store.consume_token("t1").unwrap();
        assert!(store.find_usable_reset_token("h1").unwrap().is_none());
        assert!(matches!(
            store.consume_token("t1").unwrap_err(),
            Error::NotFound
        ));
    }

    #[test]
    fn test_session_lifecycle() {
        let (_dir, store) = open_store();
        store.create_shell_user(&shell_user("u1", "a@a")).unwrap();
        store.update_password("u1", "$argon2id$fake").unwrap();
        let role = store.ensure_role("user", None).unwrap();
        store.assign_role("u1", &role.id).unwrap();
        let perm = store.ensure_permission("nodes:read", None).unwrap();
        store
            .replace_role_permissions(&role.id, &[perm.id.clone()])
            .unwrap();

        let now = Utc::now();
        store
            .create_session(&Session {
                id: "s1".into(),
                user_id: "u1".into(),
                token_hash: "th1".into(),
                created_at: now,
                expires_at: now + Duration::days(7),
                revoked_at: None,
                last_seen_at: None,
                ip: None,
                user_agent: None,
            })
            .unwrap();

        let identity = store
            .find_active_session_by_token_hash("th1")
            .unwrap()
            .unwrap();
        assert_eq!(identity.user.id, "u1");
        assert_eq!(identity.roles, vec!["user"]);
        assert_eq!(identity.permissions, vec!["nodes:read"]);

        store.revoke_session_by_token_hash("th1").unwrap();
        assert!(
            store
                .find_active_session_by_token_hash("th1")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_expired_session_is_inactive() {
        let (_dir, store) = open_store();
        store.create_shell_user(&shell_user("u1", "a@a")).unwrap();
        let now = Utc::now();
        store
            .create_session(&Session {
                id: "s1".into(),
                user_id: "u1".into(),
                token_hash: "th1".into(),
                created_at: now - Duration::days(8),
                expires_at: now - Duration::days(1),
                revoked_at: None,
                last_seen_at: None,
                ip: None,
                user_agent: None,
            })
            .unwrap();
        assert!(
            store
                .find_active_session_by_token_hash("th1")
                .unwrap()
                .is_none()
        );
    }
}

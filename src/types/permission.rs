//! Permission codes and role names.
//!
//! Codes are opaque dotted-colon strings; an authorization check is always a
//! set-membership test over the session's effective codes and never parses a
//! code at check time. Per-node codes (`node:read:<id>`, `node:write:<id>`)
//! are provisioned lazily on the first role edit that references them.

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_USER: &str = "user";

pub const HEALTH_READ: &str = "health:read";
pub const NODES_READ: &str = "nodes:read";
pub const NODES_CREATE: &str = "nodes:create";
pub const NODES_DELETE: &str = "nodes:delete";
pub const USERS_CREATE: &str = "users:create";
pub const USERS_READ: &str = "users:read";
pub const ROLES_ASSIGN: &str = "roles:assign";
pub const AUTH_ME: &str = "auth:me";

/// Static codes seeded at startup, with their descriptions.
pub const STATIC_PERMISSIONS: &[(&str, &str)] = &[
    (HEALTH_READ, "Read service health"),
    (NODES_READ, "Read all nodes"),
    (NODES_CREATE, "Register new nodes"),
    (NODES_DELETE, "Delete nodes"),
    (USERS_CREATE, "Invite users"),
    (USERS_READ, "List users"),
    (ROLES_ASSIGN, "Assign roles to users"),
    (AUTH_ME, "Read own identity"),
];

#[must_use]
pub fn node_read_code(node_id: &str) -> String {
    format!("node:read:{node_id}")
}

#[must_use]
pub fn node_write_code(node_id: &str) -> String {
    format!("node:write:{node_id}")
}

/// True for the auto-provisioned per-node codes.
#[must_use]
pub fn is_dynamic_node_code(code: &str) -> bool {
    code.strip_prefix("node:read:")
        .or_else(|| code.strip_prefix("node:write:"))
        .is_some_and(|id| !id.is_empty())
}

#[must_use]
pub fn is_static_code(code: &str) -> bool {
    STATIC_PERMISSIONS.iter().any(|(c, _)| *c == code)
}

/// Role names are lowercase: `^[a-z][a-z0-9:_-]*$`.
#[must_use]
pub fn is_valid_role_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, ':' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_node_codes() {
        assert!(is_dynamic_node_code("node:read:01HX5K"));
        assert!(is_dynamic_node_code("node:write:01HX5K"));
        assert!(!is_dynamic_node_code("node:read:"));
        assert!(!is_dynamic_node_code("nodes:read"));
        assert!(!is_dynamic_node_code("node:admin:01HX5K"));
    }

    #[test]
    fn test_static_codes_are_seeded() {
        assert!(is_static_code("nodes:read"));
        assert!(!is_static_code("node:read:abc"));
    }

    #[test]
    fn test_role_name_validation() {
        assert!(is_valid_role_name("admin"));
        assert!(is_valid_role_name("ops:read-only_2"));
        assert!(!is_valid_role_name(""));
        assert!(!is_valid_role_name("Admin"));
        assert!(!is_valid_role_name("1admin"));
        assert!(!is_valid_role_name("ops team"));
    }

    #[test]
    fn test_code_builders() {
        assert_eq!(node_read_code("n1"), "node:read:n1");
        assert_eq!(node_write_code("n1"), "node:write:n1");
    }
}

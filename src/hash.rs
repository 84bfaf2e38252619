//! SHA-256 helpers and the canonical JSON stringification shared by the
//! agent and the server. The stable form (object keys sorted, arrays in
//! source order, no whitespace) is the interop contract for inventory
//! change detection.

use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Serializes a JSON value with object keys sorted lexicographically and no
/// whitespace. Arrays keep their source order.
pub fn stable_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_stable(value, &mut out);
    out
}

/// Lowercase hex SHA-256 of the stable stringification.
pub fn stable_hash(value: &Value) -> String {
    sha256_hex(stable_stringify(value).as_bytes())
}

fn write_stable(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json string serialization never fails
            out.push_str(&serde_json::to_string(s).unwrap_or_default());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_stable(&map[key], out);
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_stable_stringify_sorts_keys() {
        let v = json!({"b": 1, "a": 2});
        assert_eq!(stable_stringify(&v), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn test_stable_stringify_nested() {
        let v = json!({
            "z": {"y": [3, 1, 2], "x": null},
            "a": "text",
        });
        assert_eq!(
            stable_stringify(&v),
            r#"{"a":"text","z":{"x":null,"y":[3,1,2]}}"#
        );
    }

    #[test]
    fn test_stable_stringify_preserves_array_order() {
        let v = json!([{"b": 1, "a": 2}, "second"]);
        assert_eq!(stable_stringify(&v), r#"[{"a":2,"b":1},"second"]"#);
    }

    #[test]
    fn test_stable_hash_is_key_order_independent() {
        let a: serde_json::Value = serde_json::from_str(r#"{"one":1,"two":2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"two":2,"one":1}"#).unwrap();
        assert_eq!(stable_hash(&a), stable_hash(&b));
        assert_eq!(stable_hash(&a).len(), 64);
        assert!(stable_hash(&a).chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_stable_stringify_escapes_strings() {
        let v = json!({"k": "line\nbreak \"quoted\""});
        assert_eq!(stable_stringify(&v), r#"{"k":"line\nbreak \"quoted\""}"#);
    }
}

//! Structural validation of paths, values, and function names.
//!
//! The shared state is path-addressed JSON that ultimately lands in
//! dynamic-language peers, so any key that could alias a host object's
//! prototype chain is rejected outright, on every ingress path: local
//! operation construction, wire decode, and CRDT apply all call into here.

use serde_json::Value;

use crate::error::{ProtoError, Result};

/// Keys that could corrupt a host-language object prototype or impersonate
/// reserved attributes. Rejected wherever they appear: path segments,
/// object keys, and string elements used as keys.
pub const BLOCKED_KEYS: [&str; 4] = ["__proto__", "constructor", "prototype", "__class__"];

/// Maximum nesting depth for any JSON value.
pub const MAX_NESTING_DEPTH: usize = 5;

/// Maximum serialized size of a single value (100 KiB).
pub const MAX_VALUE_SIZE: usize = 100 * 1024;

/// Maximum size of a whole wire message (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Is `key` one of the blocked sentinels?
#[inline]
#[must_use]
pub fn is_blocked_key(key: &str) -> bool {
    BLOCKED_KEYS.contains(&key)
}

/// Validate a path: every segment must be non-empty and must not be a
/// blocked key. The empty path (root) is valid.
pub fn check_path(segments: &[String]) -> Result<()> {
    for (index, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            return Err(ProtoError::EmptyPathSegment { index });
        }
        if is_blocked_key(segment) {
            return Err(ProtoError::DangerousKey { key: segment.clone() });
        }
    }
    Ok(())
}

/// Validate a value: recurse into object keys and array elements, rejecting
/// blocked keys and enforcing the nesting-depth cap.
pub fn check_value(value: &Value) -> Result<()> {
    check_value_at_depth(value, 1)
}

fn check_value_at_depth(value: &Value, depth: usize) -> Result<()> {
    if depth > MAX_NESTING_DEPTH {
        return Err(ProtoError::DepthExceeded { depth, limit: MAX_NESTING_DEPTH });
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if is_blocked_key(key) {
                    return Err(ProtoError::DangerousKey { key: key.clone() });
                }
                check_value_at_depth(child, depth + 1)?;
            }
        }
        Value::Array(items) => {
            for child in items {
                check_value_at_depth(child, depth + 1)?;
            }
        }
        Value::String(s) => {
            if is_blocked_key(s) {
                return Err(ProtoError::DangerousKey { key: s.clone() });
            }
        }
        _ => {}
    }
    Ok(())
}

/// Enforce the serialized size cap for a single value.
pub fn check_value_size(value: &Value) -> Result<()> {
    let actual = serde_json::to_string(value)?.len();
    if actual > MAX_VALUE_SIZE {
        return Err(ProtoError::ValueTooLarge { actual, limit: MAX_VALUE_SIZE });
    }
    Ok(())
}

/// Enforce the wire size cap for a whole encoded message.
pub fn check_message_size(encoded_len: usize, limit: usize) -> Result<()> {
    if encoded_len > limit {
        return Err(ProtoError::MessageTooLong { actual: encoded_len, limit });
    }
    Ok(())
}

/// Validate a function name against `^[A-Za-z_][A-Za-z0-9_]*$`.
pub fn check_function_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ProtoError::InvalidFunctionName { name: name.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_check_path_accepts_normal_segments() {
        let path = vec!["users".to_string(), "alice".to_string(), "age".to_string()];
        assert!(check_path(&path).is_ok());
        assert!(check_path(&[]).is_ok());
    }

    #[test]
    fn test_check_path_rejects_every_blocked_key() {
        for key in BLOCKED_KEYS {
            let path = vec!["a".to_string(), key.to_string()];
            let err = check_path(&path).unwrap_err();
            assert!(matches!(err, ProtoError::DangerousKey { .. }), "{key} not rejected");
        }
    }

    #[test]
    fn test_check_path_rejects_empty_segment() {
        let path = vec!["a".to_string(), String::new()];
        assert!(matches!(
            check_path(&path).unwrap_err(),
            ProtoError::EmptyPathSegment { index: 1 }
        ));
    }

    #[test]
    fn test_check_value_recurses_into_objects_and_arrays() {
        let bad = json!({"outer": [{"__proto__": true}]});
        assert!(matches!(
            check_value(&bad).unwrap_err(),
            ProtoError::DangerousKey { .. }
        ));

        let ok = json!({"outer": [{"inner": 1}, "two", null]});
        assert!(check_value(&ok).is_ok());
    }

    #[test]
    fn test_check_value_rejects_blocked_string_element() {
        let bad = json!(["fine", "prototype"]);
        assert!(check_value(&bad).is_err());
    }

    #[test]
    fn test_check_value_depth_limit() {
        // Depth 5 is fine, depth 6 is not.
        let five = json!({"a": {"b": {"c": {"d": 1}}}});
        assert!(check_value(&five).is_ok());

        let six = json!({"a": {"b": {"c": {"d": {"e": {"f": 1}}}}}});
        assert!(matches!(
            check_value(&six).unwrap_err(),
            ProtoError::DepthExceeded { .. }
        ));
    }

    #[test]
    fn test_check_value_size() {
        let big = Value::String("x".repeat(MAX_VALUE_SIZE + 1));
        assert!(matches!(
            check_value_size(&big).unwrap_err(),
            ProtoError::ValueTooLarge { .. }
        ));
        assert!(check_value_size(&json!({"small": true})).is_ok());
    }

    #[test]
    fn test_function_names() {
        assert!(check_function_name("update_cursor").is_ok());
        assert!(check_function_name("_private").is_ok());
        assert!(check_function_name("Fn2").is_ok());

        assert!(check_function_name("").is_err());
        assert!(check_function_name("2fast").is_err());
        assert!(check_function_name("has-dash").is_err());
        assert!(check_function_name("sp ace").is_err());
        assert!(check_function_name("semi;colon").is_err());
    }
}

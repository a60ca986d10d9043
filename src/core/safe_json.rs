// ============================================
// OPSGUARD - Safe JSON Codec
// Depth/size limited parsing with key blocklisting
// ============================================

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;

/// Keys that are never accepted from untrusted documents.
pub const BLOCKED_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Nesting depth accepted by default.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Inputs larger than this are rejected before scanning.
pub const MAX_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Serialized output cap used when callers don't pick one.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Nodes nested deeper than this are replaced when stringifying.
const MAX_STRINGIFY_DEPTH: usize = 64;

const DEPTH_SENTINEL: &str = "[MaxDepth]";

lazy_static! {
    static ref BLOCKED_KEY_IN_TEXT: Regex =
        Regex::new(r#""(?:__proto__|constructor|prototype)"\s*:"#).unwrap();
}

/// Exact match against the blocklist.
pub fn is_blocked_key(key: &str) -> bool {
    BLOCKED_KEYS.contains(&key)
}

/// Substring match against the blocklist, for identifiers that become keys.
pub fn contains_blocked_key(key: &str) -> bool {
    BLOCKED_KEYS.iter().any(|blocked| key.contains(blocked))
}

/// Maximum bracket nesting of a JSON text, ignoring brackets inside strings.
///
/// Runs on the raw text so a hostile document is measured before the parser
/// ever recurses into it.
pub fn nesting_depth(text: &str) -> usize {
    let mut depth = 0usize;
    let mut max_depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for byte in text.bytes() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }

    max_depth
}

/// Parse untrusted JSON.
///
/// Returns `None` when the text is oversized, nests deeper than `max_depth`,
/// names a blocked key (unless `allow_proto_keys`), or is not valid JSON.
/// Blocked keys that slip past the text scan (e.g. written with unicode
/// escapes) are stripped from the parsed tree.
pub fn safe_json_parse(text: &str, max_depth: usize, allow_proto_keys: bool) -> Option<Value> {
    if text.len() > MAX_INPUT_BYTES {
        debug!(len = text.len(), "Rejected JSON input: too large");
        return None;
    }

    let depth = nesting_depth(text);
    if depth > max_depth {
        debug!(depth, max_depth, "Rejected JSON input: nesting too deep");
        return None;
    }

    if !allow_proto_keys && BLOCKED_KEY_IN_TEXT.is_match(text) {
        debug!("Rejected JSON input: blocked key");
        return None;
    }

    let mut value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "Rejected JSON input: parse error");
            return None;
        }
    };

    if !allow_proto_keys {
        strip_blocked_keys(&mut value);
    }

    Some(value)
}

/// First blocked key found anywhere in the tree.
pub fn find_blocked_key(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => map.iter().find_map(|(k, v)| {
            if is_blocked_key(k) {
                Some(k.clone())
            } else {
                find_blocked_key(v)
            }
        }),
        Value::Array(items) => items.iter().find_map(find_blocked_key),
        _ => None,
    }
}

/// Remove blocked keys at every level.
pub fn strip_blocked_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|k, _| !is_blocked_key(k));
            for v in map.values_mut() {
                strip_blocked_keys(v);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                strip_blocked_keys(v);
            }
        }
        _ => {}
    }
}

/// Convert any serializable value into a JSON tree that is safe to persist.
///
/// Blocked keys are dropped, nodes nested past the stringify depth limit are
/// replaced with a marker, and if the serialized form would exceed
/// `max_len` bytes a truncation object is returned instead.
pub fn safe_json_value<T: Serialize + ?Sized>(value: &T, max_len: usize) -> Value {
    let raw = match serde_json::to_value(value) {
        Ok(v) => v,
        Err(e) => {
            return json!({
                "_error": "unserializable",
                "message": e.to_string(),
            })
        }
    };

    let cleaned = clean_node(raw, 0);

    let size = serde_json::to_string(&cleaned).map(|s| s.len()).unwrap_or(usize::MAX);
    if size > max_len {
        return json!({
            "_truncated": true,
            "originalLength": size,
            "maxLength": max_len,
        });
    }

    cleaned
}

/// [`safe_json_value`] rendered as a compact string.
pub fn safe_json_stringify<T: Serialize + ?Sized>(value: &T, max_len: usize) -> String {
    serde_json::to_string(&safe_json_value(value, max_len)).unwrap_or_else(|_| "null".to_string())
}

fn clean_node(value: Value, depth: usize) -> Value {
    if depth > MAX_STRINGIFY_DEPTH {
        return Value::String(DEPTH_SENTINEL.to_string());
    }

    match value {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter(|(k, _)| !is_blocked_key(k))
                .map(|(k, v)| (k, clean_node(v, depth + 1)))
                .collect();
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| clean_node(v, depth + 1))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nesting_depth_ignores_strings() {
        assert_eq!(nesting_depth(r#"{"a": "[[[{{{"}"#), 1);
        assert_eq!(nesting_depth(r#"{"a": "\"[[", "b": [[1]]}"#), 3);
        assert_eq!(nesting_depth("42"), 0);
    }

    #[test]
    fn test_depth_limit() {
        let doc = r#"{"a": {"b": {"c": [1, 2]}}}"#;
        assert!(safe_json_parse(doc, 3, false).is_none());
        assert!(safe_json_parse(doc, 4, false).is_some());
    }

    #[test]
    fn test_deep_document_rejected_before_parse() {
        let doc = format!("{}{}", "[".repeat(100_000), "]".repeat(100_000));
        assert!(safe_json_parse(&doc, DEFAULT_MAX_DEPTH, false).is_none());
    }

    #[test]
    fn test_blocked_keys_rejected() {
        assert!(safe_json_parse(r#"{"__proto__": {"admin": true}}"#, 8, false).is_none());
        assert!(safe_json_parse(r#"{"a": {"constructor": 1}}"#, 8, false).is_none());
        assert!(safe_json_parse(r#"[{"prototype" : 1}]"#, 8, false).is_none());
    }

    #[test]
    fn test_blocked_key_as_value_is_fine() {
        let v = safe_json_parse(r#"{"name": "constructor"}"#, 8, false).unwrap();
        assert_eq!(v["name"], "constructor");
    }

    #[test]
    fn test_escaped_blocked_key_is_stripped() {
        let v = safe_json_parse(r#"{"\u005f_proto__": 1, "ok": 2}"#, 8, false).unwrap();
        assert!(v.get("__proto__").is_none());
        assert_eq!(v["ok"], 2);
    }

    #[test]
    fn test_allow_proto_keys() {
        let v = safe_json_parse(r#"{"constructor": 1}"#, 8, true).unwrap();
        assert_eq!(find_blocked_key(&v).as_deref(), Some("constructor"));
    }

    #[test]
    fn test_invalid_json_is_none() {
        assert!(safe_json_parse("{not json", 8, false).is_none());
        assert!(safe_json_parse("", 8, false).is_none());
    }

    #[test]
    fn test_stringify_strips_blocked_keys() {
        let mut map = Map::new();
        map.insert("prototype".to_string(), json!(1));
        map.insert("nested".to_string(), json!({"__proto__": 2, "keep": 3}));
        let out = safe_json_stringify(&Value::Object(map), DEFAULT_MAX_OUTPUT_BYTES);
        assert_eq!(out, r#"{"nested":{"keep":3}}"#);
    }

    #[test]
    fn test_stringify_truncation_sentinel() {
        let big = json!({ "blob": "x".repeat(500) });
        let v = safe_json_value(&big, 100);
        assert_eq!(v["_truncated"], true);
        assert_eq!(v["maxLength"], 100);
        assert!(v["originalLength"].as_u64().unwrap() > 100);
    }

    #[test]
    fn test_stringify_depth_sentinel() {
        let mut v = json!(1);
        for _ in 0..(MAX_STRINGIFY_DEPTH + 5) {
            v = json!([v]);
        }
        let out = safe_json_stringify(&v, DEFAULT_MAX_OUTPUT_BYTES);
        assert!(out.contains(DEPTH_SENTINEL));
    }
}

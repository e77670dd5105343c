//! Deep-object query string codec.
//!
//! Converts between nested maps and bracket-noted flat pairs:
//!
//! ```text
//! {"name": {"op": "ct", "value": "car"}}  <->  name[op]=ct&name[value]=car
//! {"tags": ["a", "b"]}                     <->  tags[]=a&tags[]=b
//! ```
//!
//! Leaves are strings or lists of strings. Decoding never fails: a key whose
//! brackets do not nest cleanly is kept as a literal top-level key.

use serde_json::{Map, Value};
use url::form_urlencoded;

/// Nested map produced by [`decode`] and consumed by [`encode`].
pub type DeepMap = Map<String, Value>;

/// Parse a bracket-noted query string into a nested map.
///
/// A leading `?` is ignored. Repeated keys, and keys ending in `[]`, collect
/// into a list. When the same key is used both as a scalar and as a map, the
/// first shape wins and the later pair is dropped.
pub fn decode(raw: &str) -> DeepMap {
    let mut root = Map::new();
    let raw = raw.strip_prefix('?').unwrap_or(raw);

    for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
        if key.is_empty() {
            continue;
        }
        let value = value.into_owned();
        match split_key(&key) {
            Some((head, segments)) => insert_path(&mut root, head, &segments, value),
            None => {
                tracing::debug!(key = %key, "malformed bracket key kept literally");
                insert_path(&mut root, &key, &[], value);
            }
        }
    }

    root
}

/// Flatten a nested map into a percent-encoded bracket-noted query string.
///
/// Booleans and numbers are written as their JSON text; null becomes an
/// empty value.
pub fn encode(map: &DeepMap) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    flatten(&mut serializer, None, map);
    serializer.finish()
}

// --- Internal implementation ---

/// Split `a[b][c]` into `("a", ["b", "c"])`; `a[]` yields a trailing empty segment.
///
/// Returns `None` when the brackets are malformed.
fn split_key(key: &str) -> Option<(&str, Vec<&str>)> {
    let Some(open) = key.find('[') else {
        if key.contains(']') {
            return None;
        }
        return Some((key, Vec::new()));
    };

    let head = &key[..open];
    if head.is_empty() || head.contains(']') {
        return None;
    }

    let mut segments = Vec::new();
    let mut rest = &key[open..];
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        let segment = &inner[..close];
        if segment.contains('[') {
            return None;
        }
        segments.push(segment);
        rest = &inner[close + 1..];
    }

    // `[]` only makes sense as the final segment
    if segments[..segments.len() - 1].iter().any(|s| s.is_empty()) {
        return None;
    }

    Some((head, segments))
}

fn insert_path(map: &mut DeepMap, head: &str, segments: &[&str], value: String) {
    match segments {
        [] => insert_scalar(map, head, value),
        [""] => append_list(map, head, value),
        [next, rest @ ..] => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match child {
                Value::Object(inner) => insert_path(inner, next, rest, value),
                _ => {
                    tracing::debug!(key = head, "scalar key reused as map; pair dropped");
                }
            }
        }
    }
}

fn insert_scalar(map: &mut DeepMap, key: &str, value: String) {
    match map.get_mut(key) {
        None => {
            map.insert(key.to_string(), Value::String(value));
        }
        Some(Value::Array(items)) => items.push(Value::String(value)),
        Some(existing @ Value::String(_)) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, Value::String(value)]);
        }
        Some(_) => {
            tracing::debug!(key, "map key reused as scalar; pair dropped");
        }
    }
}

fn append_list(map: &mut DeepMap, key: &str, value: String) {
    match map.get_mut(key) {
        None => {
            map.insert(key.to_string(), Value::Array(vec![Value::String(value)]));
        }
        Some(Value::Array(items)) => items.push(Value::String(value)),
        Some(existing @ Value::String(_)) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, Value::String(value)]);
        }
        Some(_) => {
            tracing::debug!(key, "map key reused as list; pair dropped");
        }
    }
}

fn flatten(
    serializer: &mut form_urlencoded::Serializer<'_, String>,
    prefix: Option<&str>,
    map: &DeepMap,
) {
    for (key, value) in map {
        let full_key = match prefix {
            Some(prefix) => format!("{}[{}]", prefix, key),
            None => key.clone(),
        };
        match value {
            Value::Object(inner) => flatten(serializer, Some(&full_key), inner),
            Value::Array(items) => {
                let list_key = format!("{}[]", full_key);
                for item in items {
                    serializer.append_pair(&list_key, &scalar_text(item));
                }
            }
            scalar => {
                serializer.append_pair(&full_key, &scalar_text(scalar));
            }
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Nested containers inside a list have no bracket form
        other => other.to_string(),
    }
}

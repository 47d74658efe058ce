//! Conversion between the wire form of OpenFlow match fields
//! (`[{"field": "ETH_DST", "value": ..., "mask": ...}]`) and a flat map
//! keyed by lowercased field name. Masked values round-trip through
//! `"value/mask"` slash notation; prefix-length expansion for IP fields is
//! left to the protocol engine.

use serde_json::{Map, Value};

/// Convert a field map into the wire's field list. Field names are
/// uppercased; string values containing `/` split into value and mask.
pub fn to_list(fields: &Map<String, Value>) -> Vec<Value> {
    fields
        .iter()
        .map(|(name, value)| make_field(name, value))
        .collect()
}

fn make_field(name: &str, value: &Value) -> Value {
    let field = name.to_ascii_uppercase();
    if let Some(text) = value.as_str() {
        if let Some((value, mask)) = text.split_once('/') {
            let mut entry = Map::new();
            entry.insert("field".to_string(), Value::String(field));
            entry.insert("value".to_string(), Value::String(value.to_string()));
            entry.insert("mask".to_string(), Value::String(mask.to_string()));
            return Value::Object(entry);
        }
    }
    let mut entry = Map::new();
    entry.insert("field".to_string(), Value::String(field));
    entry.insert("value".to_string(), value.clone());
    Value::Object(entry)
}

/// Convert the wire's field list into a map keyed by lowercased field name.
/// Entries without a `field` key are skipped.
pub fn to_map(fields: &[Value]) -> Map<String, Value> {
    let mut map = Map::new();
    for entry in fields {
        let Some(field) = entry.get("field").and_then(Value::as_str) else {
            continue;
        };
        let name = field.to_ascii_lowercase();
        let value = entry.get("value").cloned().unwrap_or(Value::Null);
        let value = match entry.get("mask") {
            Some(mask) => Value::String(format!("{}/{}", render(&value), render(mask))),
            None => value,
        };
        map.insert(name, value);
    }
    map
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

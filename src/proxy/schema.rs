//! Request schemas advertised by forwarders and the matcher the fabric
//! uses to route a request to a node whose schema accepts it.
//!
//! Only the JSON Schema keywords these schemas use are evaluated:
//! `type`, `required`, `properties`, `additionalProperties`, `const`,
//! `enum` and `minimum`. Unknown keywords are ignored.

use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::proxy::wire::HttpMethod;

/// Schema of a wire request served by a forwarder carrying `labels`.
///
/// Each label is pinned with `const` but none is required, so a request
/// naming a subset of labels (or none) still matches.
pub fn build_http_proxy_schema(labels: &HashMap<String, String>) -> Value {
    let mut label_props = Map::new();
    let mut keys: Vec<&String> = labels.keys().collect();
    keys.sort();
    for key in keys {
        label_props.insert(key.clone(), json!({ "const": labels[key] }));
    }
    let methods: Vec<&str> = HttpMethod::ALL.iter().map(|m| m.as_str()).collect();

    json!({
        "type": "object",
        "required": ["url"],
        "properties": {
            "url": { "type": "string" },
            "method": { "type": "string", "enum": methods },
            "headers": {
                "type": "object",
                "additionalProperties": { "type": "string" }
            },
            "body": { "type": "string" },
            "credentials": { "type": "string", "enum": ["omit", "same-origin", "include"] },
            "redirect": { "type": "string", "enum": ["follow", "error", "manual"] },
            "referrerPolicy": { "type": "string" },
            "timeout": { "type": "number", "minimum": 0 },
            "labels": {
                "type": "object",
                "properties": label_props
            }
        }
    })
}

/// Whether `value` satisfies `schema`.
pub fn schema_accepts(schema: &Value, value: &Value) -> bool {
    let rules = match schema {
        Value::Bool(allowed) => return *allowed,
        Value::Object(map) => map,
        // Anything else places no constraint
        _ => return true,
    };

    if let Some(expected) = rules.get("type") {
        if !type_matches(expected, value) {
            return false;
        }
    }
    if let Some(expected) = rules.get("const") {
        if expected != value {
            return false;
        }
    }
    if let Some(Value::Array(options)) = rules.get("enum") {
        if !options.contains(value) {
            return false;
        }
    }
    if let Some(min) = rules.get("minimum").and_then(Value::as_f64) {
        if let Some(n) = value.as_f64() {
            if n < min {
                return false;
            }
        }
    }

    let object = match value {
        Value::Object(object) => object,
        _ => return true,
    };

    if let Some(Value::Array(required)) = rules.get("required") {
        let missing = required
            .iter()
            .filter_map(Value::as_str)
            .any(|key| !object.contains_key(key));
        if missing {
            return false;
        }
    }

    let properties = rules.get("properties").and_then(Value::as_object);
    let additional = rules.get("additionalProperties");
    for (key, child) in object {
        match properties.and_then(|p| p.get(key)) {
            Some(child_schema) => {
                if !schema_accepts(child_schema, child) {
                    return false;
                }
            }
            None => {
                if let Some(extra) = additional {
                    if !schema_accepts(extra, child) {
                        return false;
                    }
                }
            }
        }
    }
    true
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(name) => type_name_matches(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| type_name_matches(name, value)),
        _ => true,
    }
}

fn type_name_matches(name: &str, value: &Value) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => false,
    }
}

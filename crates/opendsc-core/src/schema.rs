//! Structural parameter schemas and hash-based deduplication
//!
//! A parameter document is reduced to a value-free structural JSON Schema
//! (object shapes, scalar types, arrays as homogeneous items). The schema is
//! normalized by recursively sorting object keys, then hashed with SHA-256;
//! the lowercase hex digest is the schema's identity.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Classification of a schema change between two parameter versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaDiff {
    /// Shapes are identical
    Identical,
    /// Only new parameters were added
    Additive,
    /// A parameter was removed or changed type
    Breaking,
}

/// Derive the structural schema of a parameter document
pub fn derive_schema(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut properties = Map::new();
            for (key, child) in map {
                properties.insert(key.clone(), derive_schema(child));
            }
            let mut schema = Map::new();
            schema.insert("type".to_string(), Value::String("object".to_string()));
            schema.insert("properties".to_string(), Value::Object(properties));
            Value::Object(schema)
        }
        Value::Array(items) => {
            let mut schema = Map::new();
            schema.insert("type".to_string(), Value::String("array".to_string()));
            // Arrays are treated as homogeneous; an empty array has an
            // unconstrained item schema.
            let item_schema = items
                .first()
                .map(derive_schema)
                .unwrap_or_else(|| Value::Object(Map::new()));
            schema.insert("items".to_string(), item_schema);
            Value::Object(schema)
        }
        Value::String(_) => scalar_schema("string"),
        Value::Number(_) => scalar_schema("number"),
        Value::Bool(_) => scalar_schema("boolean"),
        Value::Null => scalar_schema("null"),
    }
}

fn scalar_schema(type_name: &str) -> Value {
    let mut schema = Map::new();
    schema.insert("type".to_string(), Value::String(type_name.to_string()));
    Value::Object(schema)
}

/// Serialize a schema with recursively sorted object keys and canonical
/// number forms
pub fn normalize_schema(schema: &Value) -> String {
    let mut out = String::new();
    write_canonical(schema, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            let mut first = true;
            for (key, child) in sorted {
                if !first {
                    out.push(',');
                }
                first = false;
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(child, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            let mut first = true;
            for item in items {
                if !first {
                    out.push(',');
                }
                first = false;
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Number(n) => {
            // Canonical form: integers without a fractional part, floats as
            // serde_json renders them.
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(u) = n.as_u64() {
                out.push_str(&u.to_string());
            } else {
                out.push_str(&n.to_string());
            }
        }
        other => {
            out.push_str(&serde_json::to_string(other).expect("scalar serializes"));
        }
    }
}

/// SHA-256 of the normalized schema serialization, lowercase hex
pub fn schema_hash(schema: &Value) -> String {
    let normalized = normalize_schema(schema);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derive-and-hash convenience for a raw parameter document
pub fn document_schema_hash(document: &Value) -> String {
    schema_hash(&derive_schema(document))
}

/// Classify the structural change from `old` to `new`
///
/// Both inputs are structural schemas as produced by [`derive_schema`].
pub fn diff_class(old: &Value, new: &Value) -> SchemaDiff {
    if schema_hash(old) == schema_hash(new) {
        return SchemaDiff::Identical;
    }
    if is_additive(old, new) {
        SchemaDiff::Additive
    } else {
        SchemaDiff::Breaking
    }
}

/// True when every shape in `old` survives unchanged in `new`
fn is_additive(old: &Value, new: &Value) -> bool {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let old_type = old_map.get("type").and_then(Value::as_str);
            let new_type = new_map.get("type").and_then(Value::as_str);
            if old_type != new_type {
                return false;
            }
            match old_type {
                Some("object") => {
                    let empty = Map::new();
                    let old_props = old_map
                        .get("properties")
                        .and_then(Value::as_object)
                        .unwrap_or(&empty);
                    let new_props = new_map
                        .get("properties")
                        .and_then(Value::as_object)
                        .unwrap_or(&empty);
                    old_props.iter().all(|(key, old_child)| {
                        new_props
                            .get(key)
                            .map(|new_child| is_additive(old_child, new_child))
                            .unwrap_or(false)
                    })
                }
                Some("array") => {
                    let old_items = old_map.get("items").unwrap_or(&Value::Null);
                    let new_items = new_map.get("items").unwrap_or(&Value::Null);
                    is_additive(old_items, new_items)
                }
                _ => true,
            }
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_derive_schema_shapes() {
        let doc = json!({"a": 1, "b": "x", "c": {"y": true}, "d": [1, 2]});
        let schema = derive_schema(&doc);
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["a"]["type"], "number");
        assert_eq!(schema["properties"]["b"]["type"], "string");
        assert_eq!(schema["properties"]["c"]["properties"]["y"]["type"], "boolean");
        assert_eq!(schema["properties"]["d"]["items"]["type"], "number");
    }

    #[test]
    fn test_hash_is_value_free() {
        let a = json!({"timeout": 30, "host": "a.example"});
        let b = json!({"timeout": 900, "host": "b.example"});
        assert_eq!(document_schema_hash(&a), document_schema_hash(&b));
    }

    #[test]
    fn test_hash_is_key_order_independent() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 9, "a": 7});
        assert_eq!(document_schema_hash(&a), document_schema_hash(&b));
    }

    #[test]
    fn test_hash_format() {
        let h = document_schema_hash(&json!({"a": 1}));
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_diff_identical_across_patch_values() {
        let old = derive_schema(&json!({"a": 1, "nested": {"x": "v1"}}));
        let new = derive_schema(&json!({"a": 2, "nested": {"x": "v2"}}));
        assert_eq!(diff_class(&old, &new), SchemaDiff::Identical);
    }

    #[test]
    fn test_diff_additive_new_top_level_key() {
        let old = derive_schema(&json!({"a": 1}));
        let new = derive_schema(&json!({"a": 1, "b": "new"}));
        assert_eq!(diff_class(&old, &new), SchemaDiff::Additive);
    }

    #[test]
    fn test_diff_breaking_on_removal() {
        let old = derive_schema(&json!({"a": 1, "b": 2}));
        let new = derive_schema(&json!({"a": 1}));
        assert_eq!(diff_class(&old, &new), SchemaDiff::Breaking);
    }

    #[test]
    fn test_diff_breaking_on_type_change() {
        let old = derive_schema(&json!({"a": 1}));
        let new = derive_schema(&json!({"a": "now a string"}));
        assert_eq!(diff_class(&old, &new), SchemaDiff::Breaking);
    }

    #[test]
    fn test_diff_additive_in_nested_object() {
        let old = derive_schema(&json!({"svc": {"port": 80}}));
        let new = derive_schema(&json!({"svc": {"port": 80, "tls": true}}));
        assert_eq!(diff_class(&old, &new), SchemaDiff::Additive);
    }
}

//! Hierarchical parameter merging with per-leaf provenance
//!
//! Documents are merged in precedence order, low to high. Mappings merge
//! recursively; every other combination is a replacement. Arrays are leaves
//! and are never concatenated. `null` at a higher precedence replaces the
//! lower value rather than unsetting it.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// The origin of one parameter document in a merge sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSource {
    /// Scope type name, e.g. `Default`, `Region`, `Node`
    pub scope_type: String,
    /// Scope value, absent for the Default scope
    pub scope_value: Option<String>,
    /// Precedence; strictly increasing across a merge sequence
    pub precedence: i32,
}

impl MergeSource {
    pub fn new(scope_type: impl Into<String>, scope_value: Option<String>, precedence: i32) -> Self {
        Self {
            scope_type: scope_type.into(),
            scope_value,
            precedence,
        }
    }

    /// Human-readable tag, `ScopeType` or `ScopeType:value`
    pub fn tag(&self) -> String {
        match &self.scope_value {
            Some(value) => format!("{}:{}", self.scope_type, value),
            None => self.scope_type.clone(),
        }
    }
}

/// A value that lost to a higher-precedence source
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct OverriddenValue {
    /// Tag of the source that produced the losing value
    pub source: String,
    /// The losing value
    pub value: Value,
    /// Set when the losing value lived at a deeper path than the entry it is
    /// recorded under (a subtree replaced by a scalar)
    pub path: Option<String>,
}

/// Provenance of one leaf in the merged output
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct LeafProvenance {
    /// Tag of the winning source
    pub source: String,
    /// The winning value
    pub value: Value,
    /// Every prior value overridden at this path, most recent loser first
    pub overridden_by: Vec<OverriddenValue>,
}

/// Result of a merge: the combined mapping plus the provenance index
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MergeOutcome {
    /// The merged mapping
    pub merged: Value,
    /// Provenance keyed by dotted leaf path
    pub provenance: BTreeMap<String, LeafProvenance>,
}

/// Internal provenance tree mirroring the value tree
#[derive(Debug, Clone)]
enum ProvNode {
    Leaf {
        source: String,
        value: Value,
        overridden: Vec<OverriddenValue>,
    },
    Map {
        /// Tag of the source that introduced the mapping at this path
        source: String,
        children: BTreeMap<String, ProvNode>,
        /// Non-mapping values this mapping displaced when it won
        displaced: Vec<OverriddenValue>,
    },
}

/// Merge an ordered sequence of parameter documents
///
/// Every document must deserialize to a mapping from string to value, and
/// precedences must strictly increase across the sequence. An empty input
/// yields an empty mapping with empty provenance.
pub fn merge(sources: &[(MergeSource, Value)]) -> Result<MergeOutcome> {
    for pair in sources.windows(2) {
        if pair[1].0.precedence <= pair[0].0.precedence {
            return Err(Error::Validation(format!(
                "merge precedence must strictly increase: {} ({}) then {} ({})",
                pair[0].0.tag(),
                pair[0].0.precedence,
                pair[1].0.tag(),
                pair[1].0.precedence,
            )));
        }
    }

    let mut root: BTreeMap<String, ProvNode> = BTreeMap::new();

    for (source, document) in sources {
        let map = document.as_object().ok_or_else(|| {
            Error::Validation(format!(
                "document from {} is not a mapping",
                source.tag()
            ))
        })?;
        let tag = source.tag();
        for (key, value) in map {
            match root.remove(key) {
                Some(existing) => {
                    root.insert(key.clone(), merge_node(existing, value, &tag));
                }
                None => {
                    root.insert(key.clone(), build_node(value, &tag));
                }
            }
        }
    }

    let mut merged = Map::new();
    let mut provenance = BTreeMap::new();
    for (key, node) in &root {
        merged.insert(key.clone(), node_value(node));
        flatten(node, key, &mut provenance);
    }

    Ok(MergeOutcome {
        merged: Value::Object(merged),
        provenance,
    })
}

/// Build a fresh provenance node for a value that nothing preceded
fn build_node(value: &Value, tag: &str) -> ProvNode {
    match value {
        Value::Object(map) => ProvNode::Map {
            source: tag.to_string(),
            children: map
                .iter()
                .map(|(k, v)| (k.clone(), build_node(v, tag)))
                .collect(),
            displaced: Vec::new(),
        },
        other => ProvNode::Leaf {
            source: tag.to_string(),
            value: other.clone(),
            overridden: Vec::new(),
        },
    }
}

/// Merge a higher-precedence value into an existing node
fn merge_node(existing: ProvNode, incoming: &Value, tag: &str) -> ProvNode {
    match (existing, incoming) {
        // Mapping into mapping: recurse per key, absent keys retained.
        (
            ProvNode::Map {
                source,
                mut children,
                displaced,
            },
            Value::Object(map),
        ) => {
            for (key, value) in map {
                match children.remove(key) {
                    Some(child) => {
                        children.insert(key.clone(), merge_node(child, value, tag));
                    }
                    None => {
                        children.insert(key.clone(), build_node(value, tag));
                    }
                }
            }
            ProvNode::Map {
                source,
                children,
                displaced,
            }
        }
        // Mapping replaces a leaf: the leaf and its history are displaced.
        (
            ProvNode::Leaf {
                source,
                value,
                overridden,
            },
            Value::Object(_),
        ) => {
            let mut displaced = vec![OverriddenValue {
                source,
                value,
                path: None,
            }];
            displaced.extend(overridden);
            match build_node(incoming, tag) {
                ProvNode::Map {
                    source, children, ..
                } => ProvNode::Map {
                    source,
                    children,
                    displaced,
                },
                ProvNode::Leaf { .. } => unreachable!("object builds a map node"),
            }
        }
        // Leaf replaces a leaf: push the immediate loser in front.
        (
            ProvNode::Leaf {
                source,
                value,
                overridden,
            },
            other,
        ) => {
            let mut list = vec![OverriddenValue {
                source,
                value,
                path: None,
            }];
            list.extend(overridden);
            ProvNode::Leaf {
                source: tag.to_string(),
                value: other.clone(),
                overridden: list,
            }
        }
        // Leaf replaces a mapping: every shadowed subtree leaf is recorded
        // under the replacement path with its relative subpath.
        (node @ ProvNode::Map { .. }, other) => {
            let mut list = Vec::new();
            collapse(&node, None, &mut list);
            ProvNode::Leaf {
                source: tag.to_string(),
                value: other.clone(),
                overridden: list,
            }
        }
    }
}

/// Record every leaf (and its history) of a displaced subtree
fn collapse(node: &ProvNode, prefix: Option<&str>, out: &mut Vec<OverriddenValue>) {
    match node {
        ProvNode::Leaf {
            source,
            value,
            overridden,
        } => {
            out.push(OverriddenValue {
                source: source.clone(),
                value: value.clone(),
                path: prefix.map(str::to_string),
            });
            for entry in overridden {
                let path = match (&entry.path, prefix) {
                    (Some(p), Some(prefix)) => Some(format!("{}.{}", prefix, p)),
                    (Some(p), None) => Some(p.clone()),
                    (None, Some(prefix)) => Some(prefix.to_string()),
                    (None, None) => None,
                };
                out.push(OverriddenValue {
                    source: entry.source.clone(),
                    value: entry.value.clone(),
                    path,
                });
            }
        }
        ProvNode::Map {
            children, displaced, ..
        } => {
            for (key, child) in children {
                let child_prefix = match prefix {
                    Some(p) => format!("{}.{}", p, key),
                    None => key.clone(),
                };
                collapse(child, Some(&child_prefix), out);
            }
            for entry in displaced {
                out.push(OverriddenValue {
                    source: entry.source.clone(),
                    value: entry.value.clone(),
                    path: prefix.map(str::to_string).or_else(|| entry.path.clone()),
                });
            }
        }
    }
}

/// Reconstruct the merged value carried by a node
fn node_value(node: &ProvNode) -> Value {
    match node {
        ProvNode::Leaf { value, .. } => value.clone(),
        ProvNode::Map { children, .. } => {
            let mut map = Map::new();
            for (key, child) in children {
                map.insert(key.clone(), node_value(child));
            }
            Value::Object(map)
        }
    }
}

/// Emit provenance entries for every leaf under `node`
fn flatten(node: &ProvNode, path: &str, out: &mut BTreeMap<String, LeafProvenance>) {
    match node {
        ProvNode::Leaf {
            source,
            value,
            overridden,
        } => {
            out.insert(
                path.to_string(),
                LeafProvenance {
                    source: source.clone(),
                    value: value.clone(),
                    overridden_by: overridden.clone(),
                },
            );
        }
        ProvNode::Map {
            source,
            children,
            displaced,
        } => {
            // A mapping that displaced a scalar keeps an entry of its own so
            // the displaced value stays reachable from exactly one list.
            if !displaced.is_empty() {
                out.insert(
                    path.to_string(),
                    LeafProvenance {
                        source: source.clone(),
                        value: node_value(node),
                        overridden_by: displaced.clone(),
                    },
                );
            }
            for (key, child) in children {
                let child_path = format!("{}.{}", path, key);
                flatten(child, &child_path, out);
            }
        }
    }
}

/// How the raw bytes of a parameter document are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    /// Infer the format from a MIME content type, defaulting to YAML
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.contains("json") {
            DocumentFormat::Json
        } else {
            DocumentFormat::Yaml
        }
    }
}

/// Parse a parameter document, reporting failures with the source tag and
/// byte offset
pub fn parse_document(tag: &str, bytes: &[u8], format: DocumentFormat) -> Result<Value> {
    let text = std::str::from_utf8(bytes).map_err(|e| Error::Parse {
        source_tag: tag.to_string(),
        offset: e.valid_up_to(),
        message: "document is not valid UTF-8".to_string(),
    })?;

    match format {
        DocumentFormat::Json => serde_json::from_str(text).map_err(|e| Error::Parse {
            source_tag: tag.to_string(),
            offset: offset_of(text, e.line(), e.column()),
            message: e.to_string(),
        }),
        DocumentFormat::Yaml => {
            let yaml: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| {
                let offset = e.location().map(|l| l.index()).unwrap_or(0);
                Error::Parse {
                    source_tag: tag.to_string(),
                    offset,
                    message: e.to_string(),
                }
            })?;
            yaml_to_json(tag, yaml)
        }
    }
}

/// Convert a YAML value to JSON, rejecting non-string keys
fn yaml_to_json(tag: &str, value: serde_yaml::Value) -> Result<Value> {
    match value {
        serde_yaml::Value::Null => Ok(Value::Null),
        serde_yaml::Value::Bool(b) => Ok(Value::Bool(b)),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Number(i.into()))
            } else if let Some(u) = n.as_u64() {
                Ok(Value::Number(u.into()))
            } else {
                let f = n.as_f64().unwrap_or(0.0);
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(|| Error::Validation(format!("non-finite number in {}", tag)))
            }
        }
        serde_yaml::Value::String(s) => Ok(Value::String(s)),
        serde_yaml::Value::Sequence(items) => {
            let converted = items
                .into_iter()
                .map(|item| yaml_to_json(tag, item))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(converted))
        }
        serde_yaml::Value::Mapping(map) => {
            let mut out = Map::new();
            for (key, child) in map {
                let key = match key {
                    serde_yaml::Value::String(s) => s,
                    other => {
                        return Err(Error::Validation(format!(
                            "non-string mapping key in {}: {:?}",
                            tag, other
                        )))
                    }
                };
                out.insert(key, yaml_to_json(tag, child)?);
            }
            Ok(Value::Object(out))
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tag, tagged.value),
    }
}

fn offset_of(text: &str, line: usize, column: usize) -> usize {
    let mut offset = 0;
    for (idx, candidate) in text.split_inclusive('\n').enumerate() {
        if idx + 1 == line {
            return offset + column.saturating_sub(1);
        }
        offset += candidate.len();
    }
    offset
}

/// Serialize a merged document as YAML (UTF-8, no BOM)
pub fn to_yaml(value: &Value) -> Result<String> {
    serde_yaml::to_string(value)
        .map_err(|e| Error::Validation(format!("cannot render YAML: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn src(scope_type: &str, value: Option<&str>, precedence: i32) -> MergeSource {
        MergeSource::new(scope_type, value.map(str::to_string), precedence)
    }

    #[test]
    fn test_empty_input() {
        let outcome = merge(&[]).unwrap();
        assert_eq!(outcome.merged, json!({}));
        assert!(outcome.provenance.is_empty());
    }

    #[test]
    fn test_single_document_identity() {
        let doc = json!({"a": 1, "b": {"c": [1, 2]}});
        let outcome = merge(&[(src("Default", None, 0), doc.clone())]).unwrap();
        assert_eq!(outcome.merged, doc);
        assert_eq!(outcome.provenance["a"].source, "Default");
        assert!(outcome.provenance["a"].overridden_by.is_empty());
        assert_eq!(outcome.provenance["b.c"].value, json!([1, 2]));
    }

    #[test]
    fn test_three_scope_merge() {
        // Literal scenario: Default, Region:US-West, Environment:Production.
        let outcome = merge(&[
            (src("Default", None, 0), json!({"a": 1, "b": 2, "c": {"x": 10}})),
            (src("Region", Some("US-West"), 10), json!({"a": 2, "c": {"y": 20}})),
            (src("Environment", Some("Production"), 15), json!({"a": 3})),
        ])
        .unwrap();

        assert_eq!(outcome.merged, json!({"a": 3, "b": 2, "c": {"x": 10, "y": 20}}));

        let a = &outcome.provenance["a"];
        assert_eq!(a.source, "Environment:Production");
        assert_eq!(a.value, json!(3));
        assert_eq!(
            a.overridden_by,
            vec![
                OverriddenValue {
                    source: "Region:US-West".into(),
                    value: json!(2),
                    path: None
                },
                OverriddenValue {
                    source: "Default".into(),
                    value: json!(1),
                    path: None
                },
            ]
        );

        assert!(outcome.provenance["b"].overridden_by.is_empty());
        assert_eq!(outcome.provenance["c.x"].source, "Default");
        assert_eq!(outcome.provenance["c.y"].source, "Region:US-West");
    }

    #[test]
    fn test_array_replacement() {
        let outcome = merge(&[
            (src("Default", None, 0), json!({"features": ["logging"]})),
            (
                src("Environment", Some("Production"), 15),
                json!({"features": ["logging", "auth"]}),
            ),
        ])
        .unwrap();

        assert_eq!(outcome.merged, json!({"features": ["logging", "auth"]}));
        let features = &outcome.provenance["features"];
        assert_eq!(features.source, "Environment:Production");
        assert_eq!(features.overridden_by.len(), 1);
        assert_eq!(features.overridden_by[0].value, json!(["logging"]));
    }

    #[test]
    fn test_null_replaces() {
        let outcome = merge(&[
            (src("Default", None, 0), json!({"a": 1})),
            (src("Node", Some("web-1"), 100), json!({"a": null})),
        ])
        .unwrap();
        assert_eq!(outcome.merged, json!({"a": null}));
        assert_eq!(outcome.provenance["a"].value, Value::Null);
        assert_eq!(outcome.provenance["a"].overridden_by[0].value, json!(1));
    }

    #[test]
    fn test_scalar_replaces_mapping() {
        let outcome = merge(&[
            (src("Default", None, 0), json!({"svc": {"port": 80, "tls": {"on": true}}})),
            (src("Node", Some("web-1"), 100), json!({"svc": "disabled"})),
        ])
        .unwrap();

        assert_eq!(outcome.merged, json!({"svc": "disabled"}));
        let svc = &outcome.provenance["svc"];
        assert_eq!(svc.source, "Node:web-1");
        // Both shadowed subtree leaves appear, tagged with their subpaths.
        let paths: Vec<_> = svc
            .overridden_by
            .iter()
            .map(|o| o.path.clone().unwrap())
            .collect();
        assert_eq!(paths, vec!["port".to_string(), "tls.on".to_string()]);
    }

    #[test]
    fn test_mapping_replaces_scalar() {
        let outcome = merge(&[
            (src("Default", None, 0), json!({"svc": "disabled"})),
            (src("Node", Some("web-1"), 100), json!({"svc": {"port": 80}})),
        ])
        .unwrap();

        assert_eq!(outcome.merged, json!({"svc": {"port": 80}}));
        assert_eq!(outcome.provenance["svc.port"].source, "Node:web-1");
        // The displaced scalar stays reachable from the replacement entry.
        let svc = &outcome.provenance["svc"];
        assert_eq!(svc.overridden_by[0].value, json!("disabled"));
        assert_eq!(svc.overridden_by[0].source, "Default");
    }

    #[test]
    fn test_precedence_must_increase() {
        let err = merge(&[
            (src("Region", Some("US-West"), 10), json!({})),
            (src("Default", None, 0), json!({})),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_non_mapping_document_rejected() {
        let err = merge(&[(src("Default", None, 0), json!([1, 2]))]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_associativity_over_precedence() {
        let a = (src("Default", None, 0), json!({"a": 1, "n": {"x": 1}}));
        let b = (src("Region", Some("eu"), 10), json!({"a": 2, "n": {"y": 2}}));
        let c = (src("Node", Some("web-1"), 100), json!({"n": {"x": 9}}));

        let all = merge(&[a.clone(), b.clone(), c.clone()]).unwrap();
        let ab = merge(&[a, b]).unwrap();
        let staged = merge(&[
            (src("Region", Some("eu"), 10), ab.merged),
            c,
        ])
        .unwrap();

        assert_eq!(all.merged, staged.merged);
    }

    #[test]
    fn test_provenance_completeness() {
        let outcome = merge(&[
            (src("Default", None, 0), json!({"a": {"b": 1}, "c": 2})),
            (src("Node", Some("n"), 100), json!({"a": {"b": 3}, "d": [4]})),
        ])
        .unwrap();

        // Every merged leaf has an entry.
        for path in ["a.b", "c", "d"] {
            assert!(outcome.provenance.contains_key(path), "missing {}", path);
        }
        // The shadowed Default a.b appears in exactly one list.
        let shadowed: usize = outcome
            .provenance
            .values()
            .map(|p| {
                p.overridden_by
                    .iter()
                    .filter(|o| o.source == "Default" && o.value == json!(1))
                    .count()
            })
            .sum();
        assert_eq!(shadowed, 1);
    }

    #[test]
    fn test_parse_document_json_offset() {
        let err = parse_document("Default", b"{\"a\": }", DocumentFormat::Json).unwrap_err();
        match err {
            Error::Parse { source_tag, offset, .. } => {
                assert_eq!(source_tag, "Default");
                assert!(offset > 0);
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_document_yaml() {
        let value =
            parse_document("Default", b"a: 1\nb:\n  c: x\n", DocumentFormat::Yaml).unwrap();
        assert_eq!(value, json!({"a": 1, "b": {"c": "x"}}));
    }

    #[test]
    fn test_parse_document_yaml_invalid() {
        let err = parse_document("Region:eu", b"a: [1, 2\n", DocumentFormat::Yaml).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn test_yaml_output_no_bom() {
        let rendered = to_yaml(&json!({"a": 1})).unwrap();
        assert!(!rendered.starts_with('\u{feff}'));
        assert!(rendered.contains("a: 1"));
    }

    fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z]{0,8}".prop_map(|s| json!(s)),
            any::<bool>().prop_map(|b| json!(b)),
            Just(Value::Null),
        ]
    }

    fn arb_document() -> impl Strategy<Value = Value> {
        let leaf = arb_scalar();
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop::collection::btree_map("[a-c]", inner, 0..4).prop_map(|m| {
                Value::Object(m.into_iter().collect())
            })
        })
        .prop_map(|v| if v.is_object() { v } else { json!({ "k": v }) })
    }

    proptest! {
        #[test]
        fn prop_single_merge_is_identity(doc in arb_document()) {
            let outcome = merge(&[(src("Default", None, 0), doc.clone())]).unwrap();
            prop_assert_eq!(outcome.merged, doc);
        }

        #[test]
        fn prop_every_output_leaf_has_provenance(a in arb_document(), b in arb_document()) {
            let outcome = merge(&[
                (src("Default", None, 0), a),
                (src("Node", Some("n".into()), 100), b),
            ]).unwrap();

            fn walk(value: &Value, path: String, out: &mut Vec<String>) {
                match value {
                    Value::Object(map) if !map.is_empty() => {
                        for (k, v) in map {
                            let p = if path.is_empty() { k.clone() } else { format!("{path}.{k}") };
                            walk(v, p, out);
                        }
                    }
                    Value::Object(_) => {}
                    _ => out.push(path),
                }
            }

            let mut leaves = Vec::new();
            walk(&outcome.merged, String::new(), &mut leaves);
            for leaf in leaves {
                prop_assert!(outcome.provenance.contains_key(&leaf), "missing {}", leaf);
            }
        }
    }
}

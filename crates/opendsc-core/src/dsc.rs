//! The enforcement binary's JSON stdout/stderr contract
//!
//! The child's stdout is a single JSON result document; its stderr is
//! line-delimited JSON trace messages. Both are parsed with static shapes;
//! a stdout document that does not match is a hard failure, never a
//! best-effort fallback.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Parsed result document from the enforcement binary's stdout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DscResult {
    /// Exit code the child reported inside the document
    #[serde(rename = "exitCode", default)]
    pub exit_code: i32,
    /// Per-resource outcomes
    #[serde(default)]
    pub results: Vec<ResourceResult>,
    /// Run metadata
    #[serde(default)]
    pub metadata: ResultMetadata,
    /// Whether any resource reported an error
    #[serde(rename = "hadErrors", default)]
    pub had_errors: bool,
}

/// Outcome of a single resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceResult {
    /// Resource type, e.g. `OpenDSC/File`
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Instance name
    pub name: String,
    /// Embedded test/set result
    #[serde(default)]
    pub result: ResourceState,
}

/// Embedded per-resource state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceState {
    /// `null` means the resource could not determine its state and counts
    /// as not in desired state
    #[serde(rename = "inDesiredState", default)]
    pub in_desired_state: Option<bool>,
    /// Properties the set phase changed
    #[serde(rename = "changedProperties", default)]
    pub changed_properties: Vec<String>,
    /// Raw per-resource payload
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Run-level metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// Resources that demand a restart to finish converging
    #[serde(rename = "restartRequired", default)]
    pub restart_required: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl DscResult {
    /// Parse a stdout document; failures carry the first bytes for
    /// diagnostics
    pub fn parse(stdout: &[u8]) -> Result<Self> {
        serde_json::from_slice(stdout).map_err(|e| {
            let prefix_len = stdout.len().min(256);
            let prefix = String::from_utf8_lossy(&stdout[..prefix_len]);
            Error::ChildExecution(format!(
                "malformed result document: {} (first bytes: {:?})",
                e, prefix
            ))
        })
    }

    /// Test semantics: every resource reports in-desired-state true
    pub fn all_in_desired_state(&self) -> bool {
        self.results
            .iter()
            .all(|r| r.result.in_desired_state == Some(true))
    }

    /// Set semantics: success means no resource errored
    pub fn set_succeeded(&self) -> bool {
        !self.had_errors
    }

    /// Whether any resource requires a restart
    pub fn restart_required(&self) -> bool {
        !self.metadata.restart_required.is_empty()
    }
}

/// Severity levels used by trace messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl TraceLevel {
    /// Unknown levels map to info
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "error" => TraceLevel::Error,
            "warn" | "warning" => TraceLevel::Warn,
            "info" => TraceLevel::Info,
            "debug" => TraceLevel::Debug,
            "trace" => TraceLevel::Trace,
            _ => TraceLevel::Info,
        }
    }
}

/// One line-delimited JSON trace message from stderr
#[derive(Debug, Clone, Deserialize)]
pub struct TraceLine {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub fields: TraceFields,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TraceFields {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl TraceLine {
    /// Parse one stderr line; `None` means the line was not JSON and should
    /// be logged verbatim at warning level
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }

    /// Mapped severity of this message
    pub fn level(&self) -> TraceLevel {
        self.level
            .as_deref()
            .map(TraceLevel::from_name)
            .unwrap_or(TraceLevel::Info)
    }

    /// The message body, or empty when absent
    pub fn message(&self) -> &str {
        self.fields.message.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_result_document() {
        let doc = json!({
            "exitCode": 0,
            "hadErrors": false,
            "results": [
                {"type": "OpenDSC/File", "name": "motd", "result": {"inDesiredState": true}},
                {"type": "OpenDSC/Service", "name": "sshd", "result": {"inDesiredState": false}}
            ],
            "metadata": {"restartRequired": ["sshd"]}
        });
        let parsed = DscResult::parse(doc.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.results.len(), 2);
        assert!(!parsed.all_in_desired_state());
        assert!(parsed.set_succeeded());
        assert!(parsed.restart_required());
    }

    #[test]
    fn test_null_desired_state_counts_as_drift() {
        let doc = json!({
            "exitCode": 0,
            "results": [
                {"type": "T", "name": "a", "result": {"inDesiredState": null}}
            ]
        });
        let parsed = DscResult::parse(doc.to_string().as_bytes()).unwrap();
        assert!(!parsed.all_in_desired_state());
    }

    #[test]
    fn test_empty_results_are_in_desired_state() {
        let parsed = DscResult::parse(br#"{"exitCode": 0, "results": []}"#).unwrap();
        assert!(parsed.all_in_desired_state());
    }

    #[test]
    fn test_malformed_document_carries_prefix() {
        let err = DscResult::parse(b"not json at all").unwrap_err();
        match err {
            Error::ChildExecution(msg) => assert!(msg.contains("not json")),
            other => panic!("expected ChildExecution, got {other:?}"),
        }
    }

    #[test]
    fn test_trace_line_parse() {
        let line = r#"{"timestamp":"2026-01-01T00:00:00Z","level":"WARN","fields":{"message":"slow resource"}}"#;
        let parsed = TraceLine::parse(line).unwrap();
        assert_eq!(parsed.level(), TraceLevel::Warn);
        assert_eq!(parsed.message(), "slow resource");
    }

    #[test]
    fn test_trace_unknown_level_maps_to_info() {
        let line = r#"{"level":"SHOUT","fields":{"message":"x"}}"#;
        assert_eq!(TraceLine::parse(line).unwrap().level(), TraceLevel::Info);
    }

    #[test]
    fn test_trace_non_json_line() {
        assert!(TraceLine::parse("panic: something broke").is_none());
    }
}

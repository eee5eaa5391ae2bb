//! Wire contracts between the LCM and the Pull Server

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dsc::DscResult;
use crate::types::OperationKind;

/// First-time registration request, authorized by a shared registration key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// The shared registration key (`rk_<id>_<secret>`)
    #[serde(rename = "registrationKey")]
    pub registration_key: String,
    /// Fully qualified domain name of the registering node
    pub fqdn: String,
    /// PEM-encoded client certificate the node will authenticate with
    #[serde(rename = "certificatePem")]
    pub certificate_pem: String,
}

/// Registration response carrying the issued node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    #[serde(rename = "nodeId")]
    pub node_id: Uuid,
    pub fqdn: String,
}

/// Credential rotation request, authenticated by the current certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateCertificateRequest {
    /// PEM-encoded replacement certificate
    #[serde(rename = "certificatePem")]
    pub certificate_pem: String,
}

/// Response to the manifest checksum change check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumResponse {
    /// Manifest checksum of the node's currently resolved bundle
    pub checksum: String,
    /// Name of the assigned configuration or composite
    pub configuration: String,
    /// Resolved version string
    pub version: String,
    /// Entry-point file at the bundle root
    #[serde(rename = "entryPoint")]
    pub entry_point: String,
}

/// Compliance report submitted after a test or set run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceReportRequest {
    /// Which operation this report covers
    pub operation: OperationKind,
    /// Child process exit code
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    /// Whether every resource was in desired state after the operation
    #[serde(rename = "inDesiredState")]
    pub in_desired_state: bool,
    /// When the operation started
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    /// When the operation finished
    #[serde(rename = "endedAt")]
    pub ended_at: DateTime<Utc>,
    /// Full parsed result document, stored as the raw blob
    pub result: DscResult,
}

/// Stored compliance report as returned by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub id: Uuid,
    #[serde(rename = "nodeId")]
    pub node_id: Uuid,
    pub operation: OperationKind,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    #[serde(rename = "inDesiredState")]
    pub in_desired_state: bool,
    #[serde(rename = "submittedAt")]
    pub submitted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_request_wire_names() {
        let req = RegisterRequest {
            registration_key: "rk_abc_secret".into(),
            fqdn: "web-1.example.org".into(),
            certificate_pem: "-----BEGIN CERTIFICATE-----".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("registrationKey").is_some());
        assert!(json.get("certificatePem").is_some());
    }

    #[test]
    fn test_checksum_response_roundtrip() {
        let resp = ChecksumResponse {
            checksum: "ab".repeat(32),
            configuration: "WebServer".into(),
            version: "1.2.0".into(),
            entry_point: "main.dsc.yaml".into(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: ChecksumResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.checksum, resp.checksum);
    }
}

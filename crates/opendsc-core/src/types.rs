//! Shared type definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Enforcement mode of the Local Configuration Manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigurationMode {
    /// Test only; report drift without correcting it
    Monitor,
    /// Test, then apply when any resource is out of desired state
    Remediate,
}

impl fmt::Display for ConfigurationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationMode::Monitor => write!(f, "Monitor"),
            ConfigurationMode::Remediate => write!(f, "Remediate"),
        }
    }
}

impl FromStr for ConfigurationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "Monitor" => Ok(ConfigurationMode::Monitor),
            "Remediate" => Ok(ConfigurationMode::Remediate),
            other => Err(Error::Validation(format!(
                "invalid configuration mode: {:?} (expected Monitor or Remediate)",
                other
            ))),
        }
    }
}

/// Where the LCM resolves its configuration from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigurationSource {
    /// A file on the local disk
    Local,
    /// A bundle pulled from the Pull Server
    Pull,
}

impl fmt::Display for ConfigurationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationSource::Local => write!(f, "Local"),
            ConfigurationSource::Pull => write!(f, "Pull"),
        }
    }
}

impl FromStr for ConfigurationSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "Local" => Ok(ConfigurationSource::Local),
            "Pull" => Ok(ConfigurationSource::Pull),
            other => Err(Error::Validation(format!(
                "invalid configuration source: {:?} (expected Local or Pull)",
                other
            ))),
        }
    }
}

/// The enforcement operation a report covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Compliance test only
    Test,
    /// Remediation (apply)
    Set,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Test => write!(f, "Test"),
            OperationKind::Set => write!(f, "Set"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_roundtrip() {
        assert_eq!("Monitor".parse::<ConfigurationMode>().unwrap(), ConfigurationMode::Monitor);
        assert_eq!(ConfigurationMode::Remediate.to_string(), "Remediate");
        assert!("monitor".parse::<ConfigurationMode>().is_err());
    }

    #[test]
    fn test_source_roundtrip() {
        assert_eq!("Pull".parse::<ConfigurationSource>().unwrap(), ConfigurationSource::Pull);
        assert_eq!(ConfigurationSource::Local.to_string(), "Local");
    }
}

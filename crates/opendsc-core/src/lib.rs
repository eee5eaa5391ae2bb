//! # OpenDSC Core
//!
//! Core types and domain logic shared by the Pull Server and the Local
//! Configuration Manager:
//!
//! - Hierarchical parameter merging with per-leaf provenance
//! - Semantic versions with full pre-release precedence
//! - Structural parameter schemas and hash-based deduplication
//! - Manifest checksums for cheap change detection
//! - Error kinds and shared wire contracts

pub mod dsc;
pub mod error;
pub mod manifest;
pub mod merge;
pub mod naming;
pub mod schema;
pub mod types;
pub mod version;
pub mod wire;

// Re-export commonly used types
pub use error::{Error, Result};
pub use merge::{merge, LeafProvenance, MergeOutcome, MergeSource, OverriddenValue};
pub use schema::{derive_schema, diff_class, schema_hash, SchemaDiff};
pub use types::{ConfigurationMode, OperationKind};
pub use version::Version;

//! Authentication and authorization
//!
//! Operators authenticate with a session cookie or a `pat_` bearer token;
//! nodes authenticate with their mTLS client certificate, matched to a node
//! row by the SHA-256 fingerprint of the subjectPublicKeyInfo.

pub mod bootstrap;
pub mod certs;
pub mod identity;
pub mod permissions;
pub mod tokens;

pub use identity::{NodeIdentity, Operator};
pub use permissions::{require_global, require_resource, Level};

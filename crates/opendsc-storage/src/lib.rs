//! # OpenDSC Storage
//!
//! Persistence for the Pull Server: PostgreSQL repositories over `sqlx`
//! plus a content-addressed filesystem store for blob bytes. Metadata rows
//! carry content hashes; the bytes live in the content store.

pub mod content;
pub mod error;
pub mod postgres;

pub use content::ContentStore;
pub use error::{map_sqlx, StorageResult};
pub use postgres::Repositories;

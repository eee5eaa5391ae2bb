//! Mapping database failures onto the shared error kinds

use opendsc_core::Error;

/// Result alias for storage operations
pub type StorageResult<T> = Result<T, Error>;

/// Map a sqlx error onto the shared error kinds
///
/// Unique and foreign-key violations become conflicts so handlers can render
/// 409s without inspecting driver details; everything else is transient.
pub fn map_sqlx(context: &str, err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::RowNotFound => Error::NotFound(context.to_string()),
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() {
                Error::Conflict(format!("{}: already exists", context))
            } else if db.is_foreign_key_violation() {
                Error::Conflict(format!("{}: referenced row is missing or in use", context))
            } else {
                Error::TransientIo(format!("{}: {}", context, db))
            }
        }
        _ => Error::TransientIo(format!("{}: {}", context, err)),
    }
}

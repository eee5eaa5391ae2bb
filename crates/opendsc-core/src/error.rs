//! Error kinds shared across the Pull Server and the LCM

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for OpenDSC operations
#[derive(Error, Debug)]
pub enum Error {
    /// Input failed validation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness or in-use conflict
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Target is archived and no longer accepts the operation
    #[error("Archived: {0}")]
    Archived(String),

    /// A version bump does not match the observed schema change
    #[error("SemVer violation: {0}")]
    SemVerViolation(String),

    /// Caller is not authenticated
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Caller is authenticated but not permitted
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Checksum mismatch, or metadata exists without its content
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Transient I/O or network failure; retrying may succeed
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// The enforcement child process failed or produced unparseable output
    #[error("Child execution failed: {0}")]
    ChildExecution(String),

    /// Operation was cancelled
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A parameter document could not be parsed; carries the source tag
    /// and the byte offset where parsing stopped
    #[error("Parse error in {source_tag} at byte {offset}: {message}")]
    Parse {
        source_tag: String,
        offset: usize,
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Check if the error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check if the error is a conflict error
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Check if the error is transient and worth retrying on a later cycle
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientIo(_) | Error::Io(_))
    }

    /// Check if the error is an integrity error
    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::Integrity(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(Error::NotFound("x".into()).is_not_found());
        assert!(Error::Conflict("x".into()).is_conflict());
        assert!(Error::TransientIo("x".into()).is_transient());
        assert!(Error::Integrity("x".into()).is_integrity());
        assert!(!Error::Validation("x".into()).is_not_found());
    }

    #[test]
    fn test_parse_error_display() {
        let err = Error::Parse {
            source_tag: "Region:US-West".into(),
            offset: 42,
            message: "unexpected character".into(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("Region:US-West"));
        assert!(rendered.contains("42"));
    }
}

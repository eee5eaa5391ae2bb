//! API error rendering
//!
//! Every handler returns `Result<_, ApiError>`; the error kind picks the
//! status code and the body is always `{code, message, details?}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use opendsc_core::Error;

/// Wrapper turning the shared error kinds into HTTP responses
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            Error::Validation(_) | Error::Parse { .. } => (StatusCode::BAD_REQUEST, "validation"),
            Error::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            Error::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            Error::Archived(_) => (StatusCode::GONE, "archived"),
            Error::SemVerViolation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "semver_violation"),
            Error::Integrity(_) => (StatusCode::INTERNAL_SERVER_ERROR, "integrity"),
            Error::Cancelled(_) => (StatusCode::INTERNAL_SERVER_ERROR, "cancelled"),
            Error::TransientIo(_) | Error::Io(_) | Error::ChildExecution(_) | Error::Json(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }

        let details = match &self.0 {
            Error::Parse { source_tag, offset, .. } => {
                Some(json!({"source": source_tag, "offset": offset}))
            }
            _ => None,
        };

        let mut body = json!({
            "code": code,
            "message": self.0.to_string(),
        });
        if let Some(details) = details {
            body["details"] = details;
        }

        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

/// Result alias for handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::Validation("x".into()), StatusCode::BAD_REQUEST),
            (Error::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (Error::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::Conflict("x".into()), StatusCode::CONFLICT),
            (Error::Archived("x".into()), StatusCode::GONE),
            (Error::SemVerViolation("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (Error::Integrity("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).status_and_code().0, expected);
        }
    }
}

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EntitlementError>;

#[derive(Debug, Clone, Error)]
pub enum EntitlementError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Feature '{0}' already exists")]
    AlreadyExists(String),

    #[error("Feature '{0}' is mandatory and cannot be disabled or deleted")]
    MandatoryFeature(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Version conflict on '{key}': expected {expected}, found {actual}")]
    Conflict { key: String, expected: u64, actual: u64 },

    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EntitlementError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EntitlementError::Validation(_) | EntitlementError::AlreadyExists(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EntitlementError::MandatoryFeature(_) => StatusCode::FORBIDDEN,
            EntitlementError::NotFound(_) => StatusCode::NOT_FOUND,
            EntitlementError::Conflict { .. } => StatusCode::CONFLICT,
            EntitlementError::RegistryUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EntitlementError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EntitlementError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            EntitlementError::Validation(_) => "validation_error",
            EntitlementError::AlreadyExists(_) => "already_exists",
            EntitlementError::MandatoryFeature(_) => "mandatory_feature",
            EntitlementError::NotFound(_) => "not_found",
            EntitlementError::Conflict { .. } => "conflict",
            EntitlementError::RegistryUnavailable(_) => "service_unavailable",
            EntitlementError::InvalidRequest(_) => "bad_request",
            EntitlementError::Internal(_) => "internal_error",
        }
    }
}

impl From<redis::RedisError> for EntitlementError {
    fn from(err: redis::RedisError) -> Self {
        EntitlementError::RegistryUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for EntitlementError {
    fn from(err: serde_json::Error) -> Self {
        EntitlementError::Internal(format!("Corrupt registry record: {}", err))
    }
}

impl From<validator::ValidationErrors> for EntitlementError {
    fn from(err: validator::ValidationErrors) -> Self {
        EntitlementError::Validation(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &EntitlementError) -> Self {
        Self::new(err.kind(), &err.to_string(), err.status_code().as_u16())
    }
}

impl IntoResponse for EntitlementError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(ErrorResponse::from_error(&self))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            EntitlementError::Validation("x".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            EntitlementError::AlreadyExists("reports".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            EntitlementError::MandatoryFeature("core".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            EntitlementError::Conflict { key: "x".into(), expected: 1, actual: 2 }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            EntitlementError::RegistryUnavailable("down".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_response_body() {
        let body = ErrorResponse::from_error(&EntitlementError::NotFound("feature 'x'".into()));
        assert_eq!(body.error, "not_found");
        assert_eq!(body.code, 404);
        assert!(body.message.contains("feature 'x'"));
    }
}

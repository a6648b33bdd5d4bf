use std::fmt::{Display, Formatter};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use odata_core::ODataError;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OData error: {0}")]
    OData(#[from] ODataError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Failure of the dispatch pipeline itself, as opposed to an error response it produced.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    OData(#[from] ODataError),
}

impl DispatchError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Error answered directly on the HTTP surface, outside any batch slot.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    BadRequest { code: String, message: String },
    NotFound(String),
    MethodNotAllowed(String),
    ServiceUnavailable(String),
    InternalServerError(String),
}

impl ApiError {
    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::MethodNotAllowed(message.into())
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalServerError(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            ApiError::BadRequest { code, .. } => code,
            ApiError::NotFound(_) => "ResourceNotFound",
            ApiError::MethodNotAllowed(_) => "MethodNotAllowed",
            ApiError::ServiceUnavailable(_) => "ServiceUnavailable",
            ApiError::InternalServerError(_) => "InternalServerError",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::BadRequest { message, .. }
            | ApiError::NotFound(message)
            | ApiError::MethodNotAllowed(message)
            | ApiError::ServiceUnavailable(message)
            | ApiError::InternalServerError(message) => message,
        }
    }
}

impl From<ODataError> for ApiError {
    fn from(err: ODataError) -> Self {
        ApiError::bad_request(err.code(), err.to_string())
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Status={}, {}: {}",
            self.status().as_u16(),
            self.code(),
            self.message()
        )
    }
}

/// OData JSON error body.
pub fn error_body(code: &str, message: &str) -> serde_json::Value {
    json!({
        "error": {
            "code": code,
            "message": message,
        }
    })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status().is_server_error() {
            error!("{}", self);
        } else {
            warn!("{}", self);
        }
        let body = error_body(self.code(), self.message());
        (self.status(), axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_odata_error_maps_to_bad_request() {
        let err = ApiError::from(ODataError::DuplicateContentId("1".to_string()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "DuplicateContentId");
        assert_eq!(
            err.to_string(),
            "Status=400, DuplicateContentId: Content-ID '1' is declared more than once in the batch"
        );
    }
}

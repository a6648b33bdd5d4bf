use axum::body::Bytes;
use axum::http::header::{CONTENT_TYPE, LOCATION};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use odata_core::ODataError;
use strum::Display;

use crate::errors::error_body;

/// One sub-request of a batch, or a plain request routed through the pipeline.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub method: Method,
    /// URI as written by the client; absolute once content-IDs are resolved.
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub content_id: Option<String>,
}

impl OperationRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            content_id: None,
        }
    }

    pub fn with_body(mut self, content_type: &'static str, body: impl Into<Bytes>) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        self.body = body.into();
        self
    }

    pub fn with_content_id(mut self, content_id: impl Into<String>) -> Self {
        self.content_id = Some(content_id.into());
        self
    }
}

/// Operations reported as one atomic unit.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    /// Multipart boundary or JSON atomicity group.
    pub id: String,
    pub operations: Vec<OperationRequest>,
}

#[derive(Debug, Clone)]
pub enum BatchItem {
    Operation(OperationRequest),
    ChangeSet(ChangeSet),
}

impl BatchItem {
    pub fn operations(&self) -> Vec<&OperationRequest> {
        match self {
            BatchItem::Operation(operation) => vec![operation],
            BatchItem::ChangeSet(changeset) => changeset.operations.iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BatchFormat {
    #[strum(serialize = "multipart")]
    Multipart,
    #[strum(serialize = "json")]
    Json,
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub format: BatchFormat,
    pub items: Vec<BatchItem>,
}

impl BatchRequest {
    pub fn operation_count(&self) -> usize {
        self.items.iter().map(|item| item.operations().len()).sum()
    }
}

/// Limits enforced while the envelope is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchQuotas {
    pub max_parts: usize,
    pub max_changeset_operations: usize,
}

impl Default for BatchQuotas {
    fn default() -> Self {
        Self {
            max_parts: 100,
            max_changeset_operations: 100,
        }
    }
}

impl BatchQuotas {
    pub fn check_parts(&self, parts: usize) -> Result<(), ODataError> {
        if parts > self.max_parts {
            return Err(ODataError::QuotaExceeded(format!(
                "batch has {} parts, at most {} are allowed",
                parts, self.max_parts
            )));
        }
        Ok(())
    }

    pub fn check_changeset(&self, operations: usize) -> Result<(), ODataError> {
        if operations > self.max_changeset_operations {
            return Err(ODataError::QuotaExceeded(format!(
                "changeset has {} operations, at most {} are allowed",
                operations, self.max_changeset_operations
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OperationResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Echo of the request's content-ID.
    pub content_id: Option<String>,
}

impl OperationResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            content_id: None,
        }
    }

    pub fn json(status: StatusCode, body: &serde_json::Value) -> Self {
        let mut response = Self::new(status);
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json;odata.metadata=minimal"),
        );
        response.body = Bytes::from(body.to_string());
        response
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        let mut response = Self::new(status);
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        response.body = Bytes::from(body.into());
        response
    }

    pub fn error(status: StatusCode, code: &str, message: &str) -> Self {
        Self::json(status, &error_body(code, message))
    }

    pub fn from_odata_error(status: StatusCode, err: &ODataError) -> Self {
        Self::error(status, err.code(), &err.to_string())
    }

    /// Answer for a changeset member skipped after an earlier member failed.
    pub fn failed_dependency() -> Self {
        Self::error(
            StatusCode::FAILED_DEPENDENCY,
            "FailedDependency",
            "A previous operation in the changeset failed",
        )
    }

    pub fn with_location(mut self, location: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(location) {
            self.headers.insert(LOCATION, value);
        }
        self
    }

    pub fn location(&self) -> Option<&str> {
        self.headers
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

impl IntoResponse for OperationResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

#[derive(Debug, Clone)]
pub struct ChangeSetResponse {
    pub id: String,
    pub responses: Vec<OperationResponse>,
    /// Set when a member failed; later members carry 424.
    pub failed: bool,
}

#[derive(Debug, Clone)]
pub enum BatchResponseItem {
    Operation(OperationResponse),
    ChangeSet(ChangeSetResponse),
}

impl BatchResponseItem {
    pub fn responses(&self) -> Vec<&OperationResponse> {
        match self {
            BatchResponseItem::Operation(response) => vec![response],
            BatchResponseItem::ChangeSet(changeset) => changeset.responses.iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quotas() {
        let quotas = BatchQuotas {
            max_parts: 2,
            max_changeset_operations: 1,
        };
        assert!(quotas.check_parts(2).is_ok());
        assert!(matches!(quotas.check_parts(3), Err(ODataError::QuotaExceeded(_))));
        assert!(matches!(
            quotas.check_changeset(2),
            Err(ODataError::QuotaExceeded(_))
        ));
    }

    #[test]
    fn test_location_round_trip() {
        let response = OperationResponse::new(StatusCode::CREATED)
            .with_location("http://localhost/odata/Customers('A')");
        assert_eq!(response.location(), Some("http://localhost/odata/Customers('A')"));
        assert!(response.is_success());
        assert_eq!(
            OperationResponse::failed_dependency().status,
            StatusCode::FAILED_DEPENDENCY
        );
    }
}

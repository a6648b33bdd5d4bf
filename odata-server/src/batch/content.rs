use axum::body::Bytes;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use odata_core::{ODataResult, WriterSettings, ODATA_VERSION_HEADER};

use super::json::{self, APPLICATION_JSON};
use super::model::{BatchFormat, BatchResponseItem};
use super::multipart::{self, MULTIPART_MIXED};
use crate::errors::ApiError;

pub const PREFERENCE_APPLIED: &str = "Preference-Applied";

/// Ordered responses of one batch plus the headers of the envelope carrying them.
#[derive(Debug, Clone)]
pub struct BatchContent {
    responses: Vec<BatchResponseItem>,
    format: BatchFormat,
    boundary: String,
    headers: HeaderMap,
}

impl BatchContent {
    /// Multipart content gets a generated `batchresponse_<uuid>` boundary.
    pub fn new(
        responses: Vec<BatchResponseItem>,
        format: BatchFormat,
        settings: &WriterSettings,
    ) -> Self {
        Self::with_boundary(responses, format, settings, multipart::batch_boundary())
    }

    pub fn with_boundary(
        responses: Vec<BatchResponseItem>,
        format: BatchFormat,
        settings: &WriterSettings,
        boundary: impl Into<String>,
    ) -> Self {
        let boundary = boundary.into();
        let content_type = match format {
            BatchFormat::Multipart => format!("{};boundary={}", MULTIPART_MIXED, boundary),
            BatchFormat::Json => APPLICATION_JSON.to_string(),
        };

        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        if let Ok(value) = HeaderValue::from_str(&settings.version().to_string()) {
            headers.insert(HeaderName::from_static("odata-version"), value);
        }

        Self {
            responses,
            format,
            boundary,
            headers,
        }
    }

    pub fn with_preference_applied(mut self, preference: &'static str) -> Self {
        self.headers.insert(
            HeaderName::from_static("preference-applied"),
            HeaderValue::from_static(preference),
        );
        self
    }

    pub fn responses(&self) -> &[BatchResponseItem] {
        &self.responses
    }

    pub fn format(&self) -> BatchFormat {
        self.format
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn odata_version(&self) -> Option<&str> {
        self.headers
            .get(ODATA_VERSION_HEADER)
            .and_then(|value| value.to_str().ok())
    }

    pub fn serialize(&self) -> ODataResult<Vec<u8>> {
        match self.format {
            BatchFormat::Multipart => Ok(multipart::encode_responses(&self.responses, &self.boundary)),
            BatchFormat::Json => json::encode(&self.responses),
        }
    }
}

impl IntoResponse for BatchContent {
    fn into_response(self) -> Response {
        match self.serialize() {
            Ok(body) => (StatusCode::OK, self.headers, Bytes::from(body)).into_response(),
            Err(e) => ApiError::internal(format!("Failed to write batch response: {}", e))
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::model::OperationResponse;
    use odata_core::ODataVersion;

    #[test]
    fn test_headers_default_version_and_boundary() {
        let content = BatchContent::new(Vec::new(), BatchFormat::Multipart, &WriterSettings::default());
        let content_type = content.content_type().unwrap();
        assert!(content_type.starts_with("multipart/mixed;boundary=batchresponse_"));
        assert_eq!(content.odata_version(), Some("4.0"));
    }

    #[test]
    fn test_explicit_version_and_json_format() {
        let settings = WriterSettings::new(Some(ODataVersion::V401));
        let content = BatchContent::new(
            vec![BatchResponseItem::Operation(OperationResponse::new(StatusCode::NO_CONTENT))],
            BatchFormat::Json,
            &settings,
        )
        .with_preference_applied("odata.continue-on-error");
        assert_eq!(content.content_type(), Some("application/json"));
        assert_eq!(content.odata_version(), Some("4.01"));
        assert_eq!(
            content.headers().get(PREFERENCE_APPLIED).unwrap(),
            "odata.continue-on-error"
        );
        let body = String::from_utf8(content.serialize().unwrap()).unwrap();
        assert_eq!(body, r#"{"responses":[{"status":204,"headers":{}}]}"#);
    }

    #[test]
    fn test_serialized_multipart_uses_boundary() {
        let content = BatchContent::with_boundary(
            vec![BatchResponseItem::Operation(OperationResponse::new(StatusCode::OK))],
            BatchFormat::Multipart,
            &WriterSettings::default(),
            "batchresponse_fixed",
        );
        let body = String::from_utf8(content.serialize().unwrap()).unwrap();
        assert!(body.starts_with("--batchresponse_fixed\r\n"));
        assert!(body.ends_with("--batchresponse_fixed--\r\n"));
    }
}

use thiserror::Error;

use crate::segments::SegmentKind;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ODataError {
    #[error("Value cannot be null. Parameter name: {0}")]
    ArgumentNull(String),

    #[error("Value must be greater than or equal to {min}, got {actual}. Parameter name: {name}")]
    ArgumentOutOfRange {
        name: String,
        min: usize,
        actual: usize,
    },

    #[error("'ODataPathSegment' of kind '{0}' is not implemented")]
    UnsupportedSegmentKind(SegmentKind),

    #[error("Content-ID '{0}' is declared more than once in the batch")]
    DuplicateContentId(String),

    #[error("Content-ID reference '${0}' does not match any preceding request in the batch")]
    ReferenceNotFound(String),

    #[error("Failed to decode batch envelope: {0}")]
    EnvelopeDecode(String),

    #[error("Batch quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Resource segment '{0}' not found")]
    UnresolvedSegment(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("{0}")]
    NotSupported(String),

    #[error("Route parameter '{0}' is declared more than once in the template")]
    DuplicateRouteParameter(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Invalid model: {0}")]
    Model(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ODataError {
    /// Short machine-readable code used in OData error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            ODataError::ArgumentNull(_) => "ArgumentNull",
            ODataError::ArgumentOutOfRange { .. } => "ArgumentOutOfRange",
            ODataError::UnsupportedSegmentKind(_) => "UnsupportedSegmentKind",
            ODataError::DuplicateContentId(_) => "DuplicateContentId",
            ODataError::ReferenceNotFound(_) => "ReferenceNotFound",
            ODataError::EnvelopeDecode(_) => "EnvelopeDecodeFailure",
            ODataError::QuotaExceeded(_) => "QuotaExceeded",
            ODataError::UnresolvedSegment(_) => "ResourceNotFound",
            ODataError::InvalidKey(_) => "InvalidKey",
            ODataError::InvalidPath(_) => "InvalidPath",
            ODataError::NotSupported(_) => "NotSupported",
            ODataError::DuplicateRouteParameter(_) => "DuplicateRouteParameter",
            ODataError::InvalidUri(_) => "InvalidUri",
            ODataError::Model(_) => "InvalidModel",
            ODataError::Serialization(_) => "SerializationError",
        }
    }
}

impl From<serde_json::Error> for ODataError {
    fn from(err: serde_json::Error) -> Self {
        ODataError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for ODataError {
    fn from(err: url::ParseError) -> Self {
        ODataError::InvalidUri(err.to_string())
    }
}

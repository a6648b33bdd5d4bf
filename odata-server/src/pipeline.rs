use async_trait::async_trait;
use odata_core::{ContentIdMapping, DeserializerContext, WriterSettings};
use url::Url;

use crate::batch::model::{OperationRequest, OperationResponse};
use crate::errors::DispatchError;

/// Everything a dispatch may need besides the request itself.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub service_root: &'a Url,
    /// Content-IDs registered so far; only present inside a batch.
    pub content_ids: Option<&'a ContentIdMapping>,
    pub writer_settings: &'a WriterSettings,
}

impl<'a> RequestContext<'a> {
    pub fn new(service_root: &'a Url, writer_settings: &'a WriterSettings) -> Self {
        Self {
            service_root,
            content_ids: None,
            writer_settings,
        }
    }

    pub fn with_content_ids(mut self, content_ids: &'a ContentIdMapping) -> Self {
        self.content_ids = Some(content_ids);
        self
    }

    pub fn deserializer_context(&self) -> DeserializerContext<'a> {
        let ctx = DeserializerContext::new(self.service_root);
        match self.content_ids {
            Some(mapping) => ctx.with_content_ids(mapping),
            None => ctx,
        }
    }
}

/// Handles one request. Batches feed every operation through the same pipeline
/// as plain requests.
#[async_trait]
pub trait RequestPipeline: Send + Sync {
    async fn dispatch(
        &self,
        request: &OperationRequest,
        ctx: &RequestContext<'_>,
    ) -> Result<OperationResponse, DispatchError>;
}

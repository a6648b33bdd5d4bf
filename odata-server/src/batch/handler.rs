//! Batch orchestration.
//!
//! A batch moves through `Start -> ReadingEnvelope -> Dispatching* -> WritingEnvelope -> Done`.
//! Items run strictly in order through the shared [`RequestPipeline`]; content-IDs
//! registered by earlier items are visible to later ones.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderMap, StatusCode};
use odata_core::{resolve_reference, ContentIdMapping, ODataError, ODataResult, WriterSettings};
use strum::Display;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use super::content::BatchContent;
use super::json;
use super::model::{
    BatchFormat, BatchItem, BatchQuotas, BatchRequest, BatchResponseItem, ChangeSetResponse,
    OperationRequest, OperationResponse,
};
use super::multipart;
use crate::monitoring::MonitoringLayer;
use crate::pipeline::{RequestContext, RequestPipeline};

pub const CONTINUE_ON_ERROR: &str = "odata.continue-on-error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BatchState {
    Start,
    ReadingEnvelope,
    DispatchingOperation,
    DispatchingChangeSet,
    WritingEnvelope,
    Done,
}

#[derive(Debug, Error)]
pub enum BatchError {
    /// The envelope could not be read; nothing was dispatched.
    #[error(transparent)]
    Envelope(#[from] ODataError),

    #[error("Batch cancelled after {completed} completed items")]
    Cancelled { completed: usize },
}

pub struct BatchHandler<P> {
    pipeline: Arc<P>,
    service_root: Url,
    settings: WriterSettings,
    quotas: BatchQuotas,
    monitoring: Option<MonitoringLayer>,
}

impl<P: RequestPipeline> BatchHandler<P> {
    pub fn new(pipeline: Arc<P>, service_root: Url) -> Self {
        Self {
            pipeline,
            service_root,
            settings: WriterSettings::default(),
            quotas: BatchQuotas::default(),
            monitoring: None,
        }
    }

    pub fn with_settings(mut self, settings: WriterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_quotas(mut self, quotas: BatchQuotas) -> Self {
        self.quotas = quotas;
        self
    }

    pub fn with_monitoring(mut self, monitoring: Option<MonitoringLayer>) -> Self {
        self.monitoring = monitoring;
        self
    }

    pub fn service_root(&self) -> &Url {
        &self.service_root
    }

    /// Decodes the envelope and checks that content-IDs are unique across the whole batch.
    pub fn read_envelope(&self, content_type: &str, body: &[u8]) -> ODataResult<BatchRequest> {
        let (format, items) = if multipart::is_multipart_mixed(content_type) {
            (
                BatchFormat::Multipart,
                multipart::decode(content_type, body, &self.quotas)?,
            )
        } else if json::is_json(content_type) {
            (BatchFormat::Json, json::decode(body, &self.quotas)?)
        } else {
            return Err(ODataError::EnvelopeDecode(format!(
                "unsupported batch content type '{}'",
                content_type
            )));
        };

        let mut seen = HashSet::new();
        for item in &items {
            for operation in item.operations() {
                if let Some(id) = &operation.content_id {
                    if !seen.insert(id.as_str()) {
                        return Err(ODataError::DuplicateContentId(id.clone()));
                    }
                }
            }
        }

        Ok(BatchRequest { format, items })
    }

    /// Reads, executes and writes one batch.
    pub async fn process(
        &self,
        content_type: &str,
        headers: &HeaderMap,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Result<BatchContent, BatchError> {
        let batch_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        debug!(batch_id = %batch_id, state = %BatchState::Start, "Batch received");

        debug!(batch_id = %batch_id, state = %BatchState::ReadingEnvelope, "Reading envelope");
        let request = match self.read_envelope(content_type, body) {
            Ok(request) => request,
            Err(e) => {
                error!(batch_id = %batch_id, "Batch envelope rejected: {}", e);
                if let Some(monitoring) = &self.monitoring {
                    monitoring.log_batch_rejected(&batch_id, e.to_string()).await;
                }
                return Err(e.into());
            }
        };

        info!(
            batch_id = %batch_id,
            format = %request.format,
            items = request.items.len(),
            operations = request.operation_count(),
            "Executing batch"
        );
        if let Some(monitoring) = &self.monitoring {
            monitoring
                .log_batch_received(&batch_id, &request.format.to_string(), request.operation_count())
                .await;
        }

        let responses = match self.run(&batch_id, &request, cancel).await {
            Ok(responses) => responses,
            Err(e) => {
                error!(batch_id = %batch_id, "Batch aborted: {}", e);
                if let Some(monitoring) = &self.monitoring {
                    monitoring.log_error(format!("Batch {} aborted: {}", batch_id, e)).await;
                }
                return Err(e);
            }
        };

        debug!(batch_id = %batch_id, state = %BatchState::WritingEnvelope, "Writing envelope");
        let mut content = BatchContent::new(responses, request.format, &self.settings);
        if prefers_continue_on_error(headers) {
            content = content.with_preference_applied(CONTINUE_ON_ERROR);
        }

        let elapsed = started.elapsed().as_millis();
        info!(
            batch_id = %batch_id,
            responses = content.responses().len(),
            elapsed_ms = elapsed as u64,
            "Batch completed"
        );
        if let Some(monitoring) = &self.monitoring {
            monitoring
                .log_batch_completed(&batch_id, content.responses().len(), elapsed)
                .await;
        }
        debug!(batch_id = %batch_id, state = %BatchState::Done, "Batch done");

        Ok(content)
    }

    /// Dispatches every item in order. Responses line up one-to-one with the items.
    pub async fn execute(
        &self,
        request: &BatchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<BatchResponseItem>, BatchError> {
        self.run(&Uuid::new_v4().to_string(), request, cancel).await
    }

    async fn run(
        &self,
        batch_id: &str,
        request: &BatchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<BatchResponseItem>, BatchError> {
        let mut mapping = ContentIdMapping::new();
        let mut responses = Vec::with_capacity(request.items.len());

        for item in &request.items {
            if cancel.is_cancelled() {
                return Err(BatchError::Cancelled {
                    completed: responses.len(),
                });
            }

            match item {
                BatchItem::Operation(operation) => {
                    debug!(
                        batch_id = %batch_id,
                        state = %BatchState::DispatchingOperation,
                        method = %operation.method,
                        uri = %operation.uri,
                        "Dispatching operation"
                    );
                    let response = self
                        .dispatch_operation(batch_id, operation, &mapping, cancel)
                        .await
                        .ok_or(BatchError::Cancelled {
                            completed: responses.len(),
                        })?;
                    register_location(operation, &response, &mut mapping);
                    responses.push(BatchResponseItem::Operation(response));
                }
                BatchItem::ChangeSet(changeset) => {
                    debug!(
                        batch_id = %batch_id,
                        state = %BatchState::DispatchingChangeSet,
                        changeset = %changeset.id,
                        operations = changeset.operations.len(),
                        "Dispatching changeset"
                    );

                    // Content-IDs of a failed changeset must not leak into later items.
                    let mut staged = mapping.clone();
                    let mut changeset_responses = Vec::with_capacity(changeset.operations.len());
                    let mut failed_at = None;

                    for (index, operation) in changeset.operations.iter().enumerate() {
                        if failed_at.is_some() {
                            let mut skipped = OperationResponse::failed_dependency();
                            skipped.content_id = operation.content_id.clone();
                            changeset_responses.push(skipped);
                            continue;
                        }

                        let response = self
                            .dispatch_operation(batch_id, operation, &staged, cancel)
                            .await
                            .ok_or(BatchError::Cancelled {
                                completed: responses.len(),
                            })?;
                        if response.is_success() {
                            register_location(operation, &response, &mut staged);
                        } else {
                            failed_at = Some(index);
                        }
                        changeset_responses.push(response);
                    }

                    match failed_at {
                        Some(index) => {
                            let skipped = changeset.operations.len() - index - 1;
                            warn!(
                                batch_id = %batch_id,
                                changeset = %changeset.id,
                                skipped,
                                "Changeset failed"
                            );
                            if let Some(monitoring) = &self.monitoring {
                                monitoring
                                    .log_changeset_failed(batch_id, &changeset.id, skipped)
                                    .await;
                            }
                        }
                        None => mapping = staged,
                    }

                    responses.push(BatchResponseItem::ChangeSet(ChangeSetResponse {
                        id: changeset.id.clone(),
                        responses: changeset_responses,
                        failed: failed_at.is_some(),
                    }));
                }
            }
        }

        Ok(responses)
    }

    /// Resolves content-ID references and dispatches one operation. `None` means the
    /// batch was cancelled while the operation was in flight.
    async fn dispatch_operation(
        &self,
        batch_id: &str,
        operation: &OperationRequest,
        mapping: &ContentIdMapping,
        cancel: &CancellationToken,
    ) -> Option<OperationResponse> {
        let mut response = match resolve_reference(&operation.uri, mapping, &self.service_root) {
            Err(e @ ODataError::ReferenceNotFound(_)) => {
                warn!(batch_id = %batch_id, uri = %operation.uri, "{}", e);
                OperationResponse::from_odata_error(StatusCode::NOT_FOUND, &e)
            }
            Err(e) => {
                warn!(batch_id = %batch_id, uri = %operation.uri, "Invalid request URI: {}", e);
                OperationResponse::from_odata_error(StatusCode::BAD_REQUEST, &e)
            }
            Ok(uri) => {
                let mut resolved = operation.clone();
                resolved.uri = uri.to_string();
                let ctx = RequestContext::new(&self.service_root, &self.settings)
                    .with_content_ids(mapping);

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    result = self.pipeline.dispatch(&resolved, &ctx) => match result {
                        Ok(response) => response,
                        Err(e) => {
                            warn!(batch_id = %batch_id, uri = %resolved.uri, "Dispatch failed: {}", e);
                            OperationResponse::error(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                "DispatchError",
                                &e.to_string(),
                            )
                        }
                    }
                }
            }
        };

        response.content_id = operation.content_id.clone();
        if let Some(monitoring) = &self.monitoring {
            monitoring
                .log_operation_dispatched(
                    batch_id,
                    operation.method.as_str(),
                    &operation.uri,
                    response.status.as_u16(),
                )
                .await;
        }
        Some(response)
    }
}

fn register_location(
    operation: &OperationRequest,
    response: &OperationResponse,
    mapping: &mut ContentIdMapping,
) {
    if !response.is_success() {
        return;
    }
    if let (Some(id), Some(location)) = (&operation.content_id, response.location()) {
        match mapping.register(id.clone(), location) {
            Ok(()) => debug!(content_id = %id, location, "Registered content-ID"),
            Err(e) => warn!("{}", e),
        }
    }
}

fn prefers_continue_on_error(headers: &HeaderMap) -> bool {
    headers
        .get_all("prefer")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|preference| preference.split(';').next().unwrap_or("").trim())
        .any(|preference| {
            preference.eq_ignore_ascii_case(CONTINUE_ON_ERROR)
                || preference.eq_ignore_ascii_case("continue-on-error")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DispatchError;
    use async_trait::async_trait;
    use axum::http::{HeaderValue, Method};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records dispatched URIs. `POST` creates `<uri>('<content-id>')`, URIs containing
    /// `Fail` answer 400, `Boom` breaks the pipeline and `Slow` never finishes in time.
    #[derive(Default)]
    struct RecordingPipeline {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingPipeline {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RequestPipeline for RecordingPipeline {
        async fn dispatch(
            &self,
            request: &OperationRequest,
            ctx: &RequestContext<'_>,
        ) -> Result<OperationResponse, DispatchError> {
            self.calls.lock().unwrap().push(request.uri.clone());
            assert!(ctx.content_ids.is_some());

            if request.uri.contains("Boom") {
                return Err(DispatchError::internal("pipeline exploded"));
            }
            if request.uri.contains("Slow") {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if request.uri.contains("Fail") {
                return Ok(OperationResponse::error(
                    StatusCode::BAD_REQUEST,
                    "BadRequest",
                    "rejected",
                ));
            }
            if request.method == Method::POST {
                let id = request.content_id.clone().unwrap_or_default();
                return Ok(OperationResponse::new(StatusCode::CREATED)
                    .with_location(&format!("{}('{}')", request.uri, id)));
            }
            Ok(OperationResponse::new(StatusCode::OK))
        }
    }

    fn handler() -> (Arc<RecordingPipeline>, BatchHandler<RecordingPipeline>) {
        let pipeline = Arc::new(RecordingPipeline::default());
        let root = Url::parse("http://localhost/odata/").unwrap();
        (pipeline.clone(), BatchHandler::new(pipeline, root))
    }

    fn op(method: Method, uri: &str, content_id: Option<&str>) -> OperationRequest {
        let request = OperationRequest::new(method, uri);
        match content_id {
            Some(id) => request.with_content_id(id),
            None => request,
        }
    }

    fn changeset(id: &str, operations: Vec<OperationRequest>) -> BatchItem {
        BatchItem::ChangeSet(super::super::model::ChangeSet {
            id: id.to_string(),
            operations,
        })
    }

    fn batch(items: Vec<BatchItem>) -> BatchRequest {
        BatchRequest {
            format: BatchFormat::Multipart,
            items,
        }
    }

    fn statuses(items: &[BatchResponseItem]) -> Vec<Vec<u16>> {
        items
            .iter()
            .map(|item| item.responses().iter().map(|r| r.status.as_u16()).collect())
            .collect()
    }

    // === Ordering ===

    #[tokio::test]
    async fn test_responses_match_items_in_order() {
        let (pipeline, handler) = handler();
        let request = batch(vec![
            BatchItem::Operation(op(Method::GET, "Customers", None)),
            changeset(
                "cs1",
                vec![
                    op(Method::POST, "Customers", Some("1")),
                    op(Method::POST, "Orders", Some("2")),
                ],
            ),
            BatchItem::Operation(op(Method::GET, "Products", None)),
        ]);

        let responses = handler
            .execute(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(statuses(&responses), vec![vec![200], vec![201, 201], vec![200]]);
        assert_eq!(
            pipeline.calls(),
            vec![
                "http://localhost/odata/Customers",
                "http://localhost/odata/Customers",
                "http://localhost/odata/Orders",
                "http://localhost/odata/Products",
            ]
        );
        let BatchResponseItem::ChangeSet(cs) = &responses[1] else {
            panic!("expected changeset response");
        };
        assert!(!cs.failed);
        assert_eq!(cs.responses[0].content_id.as_deref(), Some("1"));
    }

    // === Content-ID resolution ===

    #[tokio::test]
    async fn test_later_items_see_registered_content_ids() {
        let (pipeline, handler) = handler();
        let request = batch(vec![
            changeset("cs1", vec![op(Method::POST, "Customers", Some("1"))]),
            BatchItem::Operation(op(Method::GET, "$1/Orders", None)),
        ]);

        let responses = handler
            .execute(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(statuses(&responses), vec![vec![201], vec![200]]);
        assert_eq!(
            pipeline.calls()[1],
            "http://localhost/odata/Customers('1')/Orders"
        );
    }

    #[tokio::test]
    async fn test_unknown_reference_fails_only_its_item() {
        let (pipeline, handler) = handler();
        let request = batch(vec![
            BatchItem::Operation(op(Method::GET, "$99", Some("a"))),
            BatchItem::Operation(op(Method::GET, "Customers", None)),
        ]);

        let responses = handler
            .execute(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(statuses(&responses), vec![vec![404], vec![200]]);
        assert_eq!(responses[0].responses()[0].content_id.as_deref(), Some("a"));
        assert_eq!(pipeline.calls(), vec!["http://localhost/odata/Customers"]);
    }

    #[tokio::test]
    async fn test_longer_unregistered_id_fails_only_its_item() {
        let (pipeline, handler) = handler();
        let request = batch(vec![
            BatchItem::Operation(op(Method::POST, "Customers", Some("1"))),
            BatchItem::Operation(op(Method::GET, "$10", None)),
            BatchItem::Operation(op(Method::GET, "$1/Orders?$filter=x", None)),
        ]);

        let responses = handler
            .execute(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(statuses(&responses), vec![vec![201], vec![404], vec![200]]);
        assert_eq!(
            pipeline.calls(),
            vec![
                "http://localhost/odata/Customers",
                "http://localhost/odata/Customers('1')/Orders?$filter=x",
            ]
        );
    }

    // === Changesets ===

    #[tokio::test]
    async fn test_failed_member_skips_the_rest_and_discards_content_ids() {
        let (pipeline, handler) = handler();
        let request = batch(vec![
            changeset(
                "cs1",
                vec![
                    op(Method::POST, "Customers", Some("1")),
                    op(Method::PATCH, "Fail", Some("2")),
                    op(Method::POST, "Orders", Some("3")),
                ],
            ),
            BatchItem::Operation(op(Method::GET, "$1", None)),
        ]);

        let responses = handler
            .execute(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(statuses(&responses), vec![vec![201, 400, 424], vec![404]]);
        let BatchResponseItem::ChangeSet(cs) = &responses[0] else {
            panic!("expected changeset response");
        };
        assert!(cs.failed);
        assert_eq!(cs.responses[2].content_id.as_deref(), Some("3"));
        // Orders was never dispatched and $1 was not resolvable afterwards
        assert_eq!(pipeline.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_pipeline_error_becomes_500_in_its_slot() {
        let (_, handler) = handler();
        let request = batch(vec![
            BatchItem::Operation(op(Method::GET, "Boom", None)),
            BatchItem::Operation(op(Method::GET, "Customers", None)),
        ]);

        let responses = handler
            .execute(&request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(statuses(&responses), vec![vec![500], vec![200]]);
    }

    // === Envelope ===

    #[test]
    fn test_duplicate_content_ids_are_rejected_before_dispatch() {
        let (pipeline, handler) = handler();
        let items = vec![
            BatchItem::Operation(op(Method::POST, "Customers", Some("1"))),
            changeset("cs_x", vec![op(Method::POST, "Orders", Some("1"))]),
        ];
        let body = multipart::encode_requests(&items, "batch_x");

        let result = handler.read_envelope("multipart/mixed; boundary=batch_x", &body);
        assert_eq!(
            result.unwrap_err(),
            ODataError::DuplicateContentId("1".to_string())
        );
        assert!(pipeline.calls().is_empty());
    }

    #[test]
    fn test_unsupported_content_type() {
        let (_, handler) = handler();
        assert!(matches!(
            handler.read_envelope("text/plain", b"GET Customers"),
            Err(ODataError::EnvelopeDecode(_))
        ));
    }

    #[tokio::test]
    async fn test_process_writes_envelope_and_preference() {
        let (_, handler) = handler();
        let body = serde_json::json!({
            "requests": [
                {"id": "1", "method": "POST", "url": "Customers", "body": {"CustomerID": "A"}},
                {"id": "2", "method": "GET", "url": "$1"}
            ]
        })
        .to_string();
        let mut headers = HeaderMap::new();
        headers.insert("prefer", HeaderValue::from_static("odata.continue-on-error"));

        let content = handler
            .process("application/json", &headers, body.as_bytes(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(content.format(), BatchFormat::Json);
        assert_eq!(statuses(content.responses()), vec![vec![201], vec![200]]);
        assert_eq!(
            content.headers().get("preference-applied").unwrap(),
            CONTINUE_ON_ERROR
        );
    }

    #[tokio::test]
    async fn test_process_rejects_bad_envelope() {
        let (pipeline, handler) = handler();
        let result = handler
            .process(
                "multipart/mixed; boundary=b",
                &HeaderMap::new(),
                b"--b\r\nContent-Type: application/http\r\n\r\nGET Customers HTTP/1.1\r\n",
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(BatchError::Envelope(ODataError::EnvelopeDecode(_)))));
        assert!(pipeline.calls().is_empty());
    }

    // === Cancellation ===

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (pipeline, handler) = handler();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = handler
            .execute(&batch(vec![BatchItem::Operation(op(Method::GET, "Customers", None))]), &cancel)
            .await;
        assert!(matches!(result, Err(BatchError::Cancelled { completed: 0 })));
        assert!(pipeline.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_drops_in_flight_dispatch() {
        let (pipeline, handler) = handler();
        let cancel = CancellationToken::new();
        let request = batch(vec![
            BatchItem::Operation(op(Method::GET, "Customers", None)),
            BatchItem::Operation(op(Method::GET, "Slow", None)),
            BatchItem::Operation(op(Method::GET, "Products", None)),
        ]);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = handler.execute(&request, &cancel).await;
        assert!(matches!(result, Err(BatchError::Cancelled { completed: 1 })));
        assert_eq!(pipeline.calls().len(), 2);
    }

    #[test]
    fn test_prefer_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert("prefer", HeaderValue::from_static("return=minimal, continue-on-error"));
        assert!(prefers_continue_on_error(&headers));
        assert!(!prefers_continue_on_error(&HeaderMap::new()));
    }
}

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, Method, Uri},
    response::{IntoResponse, Response},
};
use odata_core::relative_path;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::batch::{BatchError, OperationRequest};
use crate::errors::ApiError;
use crate::pipeline::{RequestContext, RequestPipeline};
use crate::AppState;

pub async fn health() -> &'static str {
    "OK"
}

/// Serves every path below the service root: `$batch` goes to the batch handler,
/// everything else straight through the request pipeline.
pub async fn odata(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut url = state.service_root.clone();
    url.set_path(uri.path());
    url.set_query(uri.query());

    let Some(relative) = relative_path(&url, &state.service_root) else {
        return ApiError::not_found(format!("'{}' is outside the service root", uri.path()))
            .into_response();
    };

    if relative == "$batch" {
        if method != Method::POST {
            return ApiError::method_not_allowed("$batch only accepts POST").into_response();
        }
        return batch(&state, &headers, &body).await;
    }

    let mut request = OperationRequest::new(method, url.to_string());
    request.headers = headers;
    request.body = body;

    let ctx = RequestContext::new(&state.service_root, &state.settings);
    match state.service.dispatch(&request, &ctx).await {
        Ok(response) => {
            let mut response = response.into_response();
            if let Ok(version) = HeaderValue::from_str(&state.settings.version().to_string()) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("odata-version"), version);
            }
            response
        }
        Err(e) => ApiError::internal(e.to_string()).into_response(),
    }
}

async fn batch(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Response {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let cancel = CancellationToken::new();
    let timeout = tokio::spawn({
        let cancel = cancel.clone();
        let limit = state.config.batch_timeout();
        async move {
            tokio::time::sleep(limit).await;
            debug!("Batch timeout of {:?} elapsed", limit);
            cancel.cancel();
        }
    });

    let result = state.batch.process(content_type, headers, body, &cancel).await;
    timeout.abort();

    match result {
        Ok(content) => content.into_response(),
        Err(BatchError::Envelope(e)) => ApiError::from(e).into_response(),
        Err(BatchError::Cancelled { completed }) => ApiError::service_unavailable(format!(
            "Batch timed out after {} completed items",
            completed
        ))
        .into_response(),
    }
}

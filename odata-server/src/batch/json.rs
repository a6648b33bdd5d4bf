//! JSON batch envelopes (`{"requests": [...]}` / `{"responses": [...]}`).

use std::collections::{BTreeMap, HashSet};

use axum::body::Bytes;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use odata_core::{ODataError, ODataResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::{
    BatchItem, BatchQuotas, BatchResponseItem, ChangeSet, OperationRequest, OperationResponse,
};

pub const APPLICATION_JSON: &str = "application/json";

#[derive(Debug, Deserialize)]
struct JsonBatchRequest {
    requests: Vec<JsonRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonRequest {
    id: String,
    method: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    atomicity_group: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
}

#[derive(Debug, Serialize)]
struct JsonBatchResponse {
    responses: Vec<JsonResponse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    atomicity_group: Option<String>,
    status: u16,
    headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
}

fn envelope_error(message: impl Into<String>) -> ODataError {
    ODataError::EnvelopeDecode(message.into())
}

pub fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|media| media.trim().eq_ignore_ascii_case(APPLICATION_JSON))
}

/// Decodes a JSON batch. Consecutive requests sharing an `atomicityGroup`
/// become one changeset.
pub fn decode(body: &[u8], quotas: &BatchQuotas) -> ODataResult<Vec<BatchItem>> {
    let batch: JsonBatchRequest = serde_json::from_slice(body)
        .map_err(|e| envelope_error(format!("invalid JSON batch: {}", e)))?;

    let mut items: Vec<BatchItem> = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut seen_groups: HashSet<String> = HashSet::new();

    for request in batch.requests {
        for dependency in &request.depends_on {
            if !seen_ids.contains(dependency) && !seen_groups.contains(dependency) {
                return Err(envelope_error(format!(
                    "request '{}' depends on '{}', which does not precede it",
                    request.id, dependency
                )));
            }
        }
        if !seen_ids.insert(request.id.clone()) {
            return Err(ODataError::DuplicateContentId(request.id));
        }

        let group = request.atomicity_group.clone();
        let operation = to_operation(request)?;

        let Some(group) = group else {
            items.push(BatchItem::Operation(operation));
            continue;
        };

        let continues_last = matches!(
            items.last(),
            Some(BatchItem::ChangeSet(changeset)) if changeset.id == group
        );
        if continues_last {
            if let Some(BatchItem::ChangeSet(changeset)) = items.last_mut() {
                changeset.operations.push(operation);
            }
        } else {
            if !seen_groups.insert(group.clone()) {
                return Err(envelope_error(format!(
                    "atomicity group '{}' is not contiguous",
                    group
                )));
            }
            items.push(BatchItem::ChangeSet(ChangeSet {
                id: group,
                operations: vec![operation],
            }));
        }
    }

    quotas.check_parts(items.len())?;
    for item in &items {
        if let BatchItem::ChangeSet(changeset) = item {
            quotas.check_changeset(changeset.operations.len())?;
        }
    }
    Ok(items)
}

fn to_operation(request: JsonRequest) -> ODataResult<OperationRequest> {
    let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| envelope_error(format!("invalid method '{}'", request.method)))?;

    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| envelope_error(format!("invalid header name '{}': {}", name, e)))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| envelope_error(format!("invalid value for header '{}': {}", name, e)))?;
        headers.insert(header_name, header_value);
    }

    let body = match request.body {
        None | Some(Value::Null) => Bytes::new(),
        Some(Value::String(text)) if !declares_json(&headers) => Bytes::from(text),
        Some(value) => {
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
            }
            Bytes::from(value.to_string())
        }
    };

    Ok(OperationRequest {
        method,
        uri: request.url,
        headers,
        body,
        content_id: Some(request.id),
    })
}

fn declares_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map_or(true, is_json)
}

fn to_json_response(response: &OperationResponse, group: Option<&str>) -> JsonResponse {
    let headers = response
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();

    let body = if response.body.is_empty() {
        None
    } else if response.content_type().is_some_and(is_json) {
        serde_json::from_slice(&response.body).ok()
    } else {
        Some(Value::String(
            String::from_utf8_lossy(&response.body).into_owned(),
        ))
    };

    JsonResponse {
        id: response.content_id.clone(),
        atomicity_group: group.map(str::to_string),
        status: response.status.as_u16(),
        headers,
        body,
    }
}

pub fn encode(items: &[BatchResponseItem]) -> ODataResult<Vec<u8>> {
    let mut responses = Vec::new();
    for item in items {
        match item {
            BatchResponseItem::Operation(response) => {
                responses.push(to_json_response(response, None));
            }
            BatchResponseItem::ChangeSet(changeset) => {
                for response in &changeset.responses {
                    responses.push(to_json_response(response, Some(&changeset.id)));
                }
            }
        }
    }
    Ok(serde_json::to_vec(&JsonBatchResponse { responses })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::model::ChangeSetResponse;
    use axum::http::StatusCode;
    use serde_json::json;

    fn decode_value(value: Value) -> ODataResult<Vec<BatchItem>> {
        decode(value.to_string().as_bytes(), &BatchQuotas::default())
    }

    #[test]
    fn test_atomicity_groups_become_changesets() {
        let items = decode_value(json!({
            "requests": [
                {"id": "1", "method": "get", "url": "Customers"},
                {"id": "2", "method": "POST", "url": "Customers", "atomicityGroup": "g1",
                 "body": {"CustomerID": "NEWCO"}},
                {"id": "3", "method": "PATCH", "url": "$2", "atomicityGroup": "g1",
                 "dependsOn": ["2"], "body": {"City": "Oslo"}},
                {"id": "4", "method": "GET", "url": "$2", "dependsOn": ["g1"]}
            ]
        }))
        .unwrap();

        assert_eq!(items.len(), 3);
        let BatchItem::Operation(first) = &items[0] else {
            panic!("expected operation");
        };
        assert_eq!(first.method, Method::GET);
        assert_eq!(first.content_id.as_deref(), Some("1"));

        let BatchItem::ChangeSet(changeset) = &items[1] else {
            panic!("expected changeset");
        };
        assert_eq!(changeset.id, "g1");
        assert_eq!(changeset.operations.len(), 2);
        assert_eq!(
            changeset.operations[0].headers.get(CONTENT_TYPE).unwrap(),
            APPLICATION_JSON
        );
        assert_eq!(&changeset.operations[0].body[..], br#"{"CustomerID":"NEWCO"}"#);
    }

    #[test]
    fn test_invalid_envelopes() {
        // id is required
        assert!(matches!(
            decode_value(json!({"requests": [{"method": "GET", "url": "Customers"}]})),
            Err(ODataError::EnvelopeDecode(_))
        ));
        // dependsOn must point backwards
        assert!(matches!(
            decode_value(json!({"requests": [
                {"id": "1", "method": "GET", "url": "Customers", "dependsOn": ["2"]},
                {"id": "2", "method": "GET", "url": "Customers"}
            ]})),
            Err(ODataError::EnvelopeDecode(_))
        ));
        // groups may not be split
        assert!(matches!(
            decode_value(json!({"requests": [
                {"id": "1", "method": "GET", "url": "A", "atomicityGroup": "g"},
                {"id": "2", "method": "GET", "url": "B"},
                {"id": "3", "method": "GET", "url": "C", "atomicityGroup": "g"}
            ]})),
            Err(ODataError::EnvelopeDecode(_))
        ));
        assert!(matches!(
            decode(b"not json", &BatchQuotas::default()),
            Err(ODataError::EnvelopeDecode(_))
        ));
    }

    #[test]
    fn test_encode_keeps_order_and_groups() {
        let mut ok = OperationResponse::json(StatusCode::OK, &json!({"value": []}));
        ok.content_id = Some("1".to_string());
        let mut skipped = OperationResponse::failed_dependency();
        skipped.content_id = Some("3".to_string());
        let mut failed = OperationResponse::new(StatusCode::BAD_REQUEST);
        failed.content_id = Some("2".to_string());

        let items = vec![
            BatchResponseItem::Operation(ok),
            BatchResponseItem::ChangeSet(ChangeSetResponse {
                id: "g1".to_string(),
                responses: vec![failed, skipped],
                failed: true,
            }),
        ];
        let body: Value = serde_json::from_slice(&encode(&items).unwrap()).unwrap();
        let responses = body["responses"].as_array().unwrap();
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0]["id"], json!("1"));
        assert_eq!(responses[0]["body"], json!({"value": []}));
        assert_eq!(responses[1]["atomicityGroup"], json!("g1"));
        assert_eq!(responses[2]["status"], json!(424));
    }
}

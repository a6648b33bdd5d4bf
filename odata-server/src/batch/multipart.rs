//! `multipart/mixed` batch envelopes.
//!
//! Each top-level part is either an `application/http` operation or a nested
//! `multipart/mixed` changeset whose parts are operations. The same reader handles
//! request envelopes (server side) and response envelopes (client side, tests).

use axum::body::Bytes;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use odata_core::{ODataError, ODataResult};
use uuid::Uuid;

use super::model::{
    BatchItem, BatchQuotas, BatchResponseItem, ChangeSet, ChangeSetResponse, OperationRequest,
    OperationResponse,
};

pub const MULTIPART_MIXED: &str = "multipart/mixed";
pub const APPLICATION_HTTP: &str = "application/http";
pub const CONTENT_ID: &str = "Content-ID";

pub fn batch_boundary() -> String {
    format!("batchresponse_{}", Uuid::new_v4())
}

pub fn changeset_boundary() -> String {
    format!("changesetresponse_{}", Uuid::new_v4())
}

fn envelope_error(message: impl Into<String>) -> ODataError {
    ODataError::EnvelopeDecode(message.into())
}

/// Media type without parameters, lower-cased.
fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

pub fn is_multipart_mixed(content_type: &str) -> bool {
    media_type(content_type) == MULTIPART_MIXED
}

pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|parameter| {
        let (name, value) = parameter.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Decodes a request envelope into ordered batch items.
pub fn decode(content_type: &str, body: &[u8], quotas: &BatchQuotas) -> ODataResult<Vec<BatchItem>> {
    let boundary = boundary_from_content_type(content_type)
        .ok_or_else(|| envelope_error("multipart/mixed content type has no boundary"))?;
    let text = std::str::from_utf8(body)
        .map_err(|e| envelope_error(format!("batch body is not valid UTF-8: {}", e)))?;

    let parts = split_parts(text, &boundary)?;
    quotas.check_parts(parts.len())?;

    parts
        .into_iter()
        .map(|part| decode_request_part(part, quotas))
        .collect()
}

/// Decodes a response envelope, as written by [`encode_responses`].
pub fn decode_responses(content_type: &str, body: &[u8]) -> ODataResult<Vec<BatchResponseItem>> {
    let boundary = boundary_from_content_type(content_type)
        .ok_or_else(|| envelope_error("multipart/mixed content type has no boundary"))?;
    let text = std::str::from_utf8(body)
        .map_err(|e| envelope_error(format!("batch body is not valid UTF-8: {}", e)))?;

    split_parts(text, &boundary)?
        .into_iter()
        .map(|part| {
            let (headers, content) = split_head(part)?;
            let part_type = header_str(&headers, CONTENT_TYPE.as_str())
                .ok_or_else(|| envelope_error("part has no Content-Type"))?;
            if is_multipart_mixed(part_type) {
                let inner_boundary = boundary_from_content_type(part_type)
                    .ok_or_else(|| envelope_error("changeset has no boundary"))?;
                let responses = split_parts(content, &inner_boundary)?
                    .into_iter()
                    .map(|inner| {
                        let (inner_headers, inner_content) = split_head(inner)?;
                        decode_response(inner_content, &inner_headers)
                    })
                    .collect::<ODataResult<Vec<_>>>()?;
                let failed = responses.iter().any(|r| !r.is_success());
                Ok(BatchResponseItem::ChangeSet(ChangeSetResponse {
                    id: inner_boundary,
                    responses,
                    failed,
                }))
            } else {
                Ok(BatchResponseItem::Operation(decode_response(content, &headers)?))
            }
        })
        .collect()
}

/// Splits `text` on `--boundary` delimiter lines up to the closing `--boundary--`.
/// The preamble and epilogue are ignored.
fn split_parts<'a>(text: &'a str, boundary: &str) -> ODataResult<Vec<&'a str>> {
    let delimiter = format!("--{}", boundary);
    let close = format!("--{}--", boundary);

    let mut parts = Vec::new();
    let mut current: Option<usize> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed == delimiter || trimmed == close {
            if let Some(start) = current {
                parts.push(strip_line_break(&text[start..offset]));
            }
            if trimmed == close {
                return Ok(parts);
            }
            current = Some(offset + line.len());
        }
        offset += line.len();
    }

    Err(envelope_error(format!("missing closing delimiter '{}'", close)))
}

/// The line break before a delimiter belongs to the delimiter, not the part.
fn strip_line_break(text: &str) -> &str {
    text.strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(text)
}

/// Splits header lines from the content that follows the first blank line.
fn split_head(text: &str) -> ODataResult<(HeaderMap, &str)> {
    let mut headers = HeaderMap::new();
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        offset += line.len();
        let line = line.trim_end();
        if line.is_empty() {
            return Ok((headers, &text[offset..]));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| envelope_error(format!("malformed header line '{}'", line)))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| envelope_error(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| envelope_error(format!("invalid value for header '{}': {}", name, e)))?;
        headers.append(name, value);
    }

    Ok((headers, ""))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn decode_request_part(part: &str, quotas: &BatchQuotas) -> ODataResult<BatchItem> {
    let (headers, content) = split_head(part)?;
    let part_type = header_str(&headers, CONTENT_TYPE.as_str())
        .ok_or_else(|| envelope_error("part has no Content-Type"))?;

    if is_multipart_mixed(part_type) {
        let boundary = boundary_from_content_type(part_type)
            .ok_or_else(|| envelope_error("changeset has no boundary"))?;
        let inner_parts = split_parts(content, &boundary)?;
        quotas.check_changeset(inner_parts.len())?;

        let mut operations = Vec::with_capacity(inner_parts.len());
        for inner in inner_parts {
            match decode_request_part(inner, quotas)? {
                BatchItem::Operation(operation) => operations.push(operation),
                BatchItem::ChangeSet(_) => {
                    return Err(envelope_error("changesets cannot be nested"));
                }
            }
        }
        return Ok(BatchItem::ChangeSet(ChangeSet {
            id: boundary,
            operations,
        }));
    }

    if media_type(part_type) != APPLICATION_HTTP {
        return Err(envelope_error(format!(
            "unsupported part Content-Type '{}'",
            part_type
        )));
    }

    decode_request(content, &headers).map(BatchItem::Operation)
}

fn decode_request(content: &str, part_headers: &HeaderMap) -> ODataResult<OperationRequest> {
    let content = content.trim_start_matches(['\r', '\n']);
    let (request_line, rest) = content.split_once('\n').unwrap_or((content, ""));

    let mut tokens = request_line.split_whitespace();
    let (Some(method), Some(uri)) = (tokens.next(), tokens.next()) else {
        return Err(envelope_error(format!("malformed request line '{}'", request_line.trim())));
    };
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| envelope_error(format!("invalid method '{}'", method)))?;

    let (headers, body) = split_head(rest)?;
    let content_id = header_str(part_headers, CONTENT_ID)
        .or_else(|| header_str(&headers, CONTENT_ID))
        .map(str::to_string);

    Ok(OperationRequest {
        method,
        uri: uri.to_string(),
        headers,
        body: Bytes::copy_from_slice(body.as_bytes()),
        content_id,
    })
}

fn decode_response(content: &str, part_headers: &HeaderMap) -> ODataResult<OperationResponse> {
    let content = content.trim_start_matches(['\r', '\n']);
    let (status_line, rest) = content.split_once('\n').unwrap_or((content, ""));
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| envelope_error(format!("malformed status line '{}'", status_line.trim())))?;

    let (headers, body) = split_head(rest)?;
    Ok(OperationResponse {
        status,
        headers,
        body: Bytes::copy_from_slice(body.as_bytes()),
        content_id: header_str(part_headers, CONTENT_ID).map(str::to_string),
    })
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

fn write_headers(out: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

fn write_part_head(out: &mut Vec<u8>, content_id: Option<&str>) {
    out.extend_from_slice(b"Content-Type: application/http\r\n");
    out.extend_from_slice(b"Content-Transfer-Encoding: binary\r\n");
    if let Some(id) = content_id {
        out.extend_from_slice(format!("{}: {}\r\n", CONTENT_ID, id).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
}

fn write_response(out: &mut Vec<u8>, response: &OperationResponse) {
    write_part_head(out, response.content_id.as_deref());
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            response.status.as_u16(),
            response.status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    write_headers(out, &response.headers);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&response.body);
    out.extend_from_slice(b"\r\n");
}

fn write_request(out: &mut Vec<u8>, request: &OperationRequest) {
    write_part_head(out, request.content_id.as_deref());
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", request.method, request.uri).as_bytes());
    write_headers(out, &request.headers);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&request.body);
    out.extend_from_slice(b"\r\n");
}

/// Writes the response envelope; changesets get a fresh `changesetresponse_` boundary.
pub fn encode_responses(items: &[BatchResponseItem], boundary: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        match item {
            BatchResponseItem::Operation(response) => write_response(&mut out, response),
            BatchResponseItem::ChangeSet(changeset) => {
                let inner = changeset_boundary();
                out.extend_from_slice(
                    format!("Content-Type: {}; boundary={}\r\n\r\n", MULTIPART_MIXED, inner)
                        .as_bytes(),
                );
                for response in &changeset.responses {
                    out.extend_from_slice(format!("--{}\r\n", inner).as_bytes());
                    write_response(&mut out, response);
                }
                out.extend_from_slice(format!("--{}--\r\n", inner).as_bytes());
            }
        }
    }
    out.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
    out
}

/// Writes a request envelope. Changesets use their `id` as boundary.
pub fn encode_requests(items: &[BatchItem], boundary: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        match item {
            BatchItem::Operation(request) => write_request(&mut out, request),
            BatchItem::ChangeSet(changeset) => {
                out.extend_from_slice(
                    format!(
                        "Content-Type: {}; boundary={}\r\n\r\n",
                        MULTIPART_MIXED, changeset.id
                    )
                    .as_bytes(),
                );
                for request in &changeset.operations {
                    out.extend_from_slice(format!("--{}\r\n", changeset.id).as_bytes());
                    write_request(&mut out, request);
                }
                out.extend_from_slice(format!("--{}--\r\n", changeset.id).as_bytes());
            }
        }
    }
    out.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
    out
}

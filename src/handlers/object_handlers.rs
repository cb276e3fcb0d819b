//! HTTP handlers for object and bucket operations.
//! Streams object bodies to avoid buffering in memory and delegates storage
//! concerns to `StorageService`.

use crate::{
    errors::AppError,
    models::{bucket::Bucket, object::Object},
    services::storage_service::{ListObjectsParams, ListObjectsResult, StorageService},
};
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use chrono::SecondsFormat;
use futures::StreamExt;
use serde::Deserialize;
use std::io;
use tokio_util::io::ReaderStream;

/// Query params accepted by ListObjectsV2.
#[derive(Debug, Deserialize)]
pub struct ListObjectsV2Query {
    #[serde(rename = "list-type")]
    pub list_type: Option<u8>,
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    #[serde(rename = "max-keys")]
    pub max_keys: Option<usize>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
    #[serde(rename = "start-after")]
    pub start_after: Option<String>,
}

/// Optional request body for `PUT /{bucket}` (create bucket).
#[derive(Debug, Default, Deserialize)]
pub struct CreateBucketReq {
    #[serde(rename = "LocationConstraint")]
    pub location_constraint: Option<String>,
}

/// Upload an object to `/{bucket}/{*key}`.
///
/// `Content-Type` and `Content-Encoding` request headers are persisted as
/// metadata and echoed back verbatim by later GET/HEAD responses.
pub async fn upload_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let content_type = header_string(&headers, &header::CONTENT_TYPE);
    let content_encoding = header_string(&headers, &header::CONTENT_ENCODING);

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let object = service
        .put_object_stream(&bucket, &key, content_type, content_encoding, stream)
        .await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    if let Some(etag) = object.etag.as_deref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            response.headers_mut().insert(header::ETAG, value);
        }
    }
    Ok(response)
}

/// Download an object `/{bucket}/{*key}` as a streaming response.
pub async fn get_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (meta, file) = service.get_object_reader(&bucket, &key).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// HEAD `/{bucket}/{*key}` — same headers as GET but no body.
pub async fn head_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let meta = service.get_object_metadata(&bucket, &key).await?;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// DELETE `/{bucket}/{*key}` — remove an object.
///
/// Deleting an absent object answers 404; the same request is always
/// answered the same way.
pub async fn delete_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let _meta = service.delete_object(&bucket, &key).await?;

    let xml = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<DeleteResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">"#,
            r#"<Deleted><Key>{}</Key></Deleted>"#,
            r#"</DeleteResult>"#
        ),
        xml_escape(&key)
    );

    Ok(xml_response(StatusCode::OK, xml))
}

/// GET `/{bucket}` — list objects, supports ?prefix=&delimiter=&max-keys=
pub async fn list_objects(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
    Query(q): Query<ListObjectsV2Query>,
) -> Result<Response, AppError> {
    let list_type = q.list_type.unwrap_or(2);
    if list_type != 2 {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "Only list-type=2 is supported",
        ));
    }

    let continuation_token_raw = q.continuation_token.clone();
    let continuation_decoded = continuation_token_raw
        .as_deref()
        .map(decode_continuation_token);
    let start_after = q.start_after.clone();
    let max_keys = q.max_keys.unwrap_or(1000).clamp(1, 1000);

    let params = ListObjectsParams {
        prefix: q.prefix.clone(),
        delimiter: q.delimiter.clone(),
        continuation_token: continuation_decoded,
        start_after: start_after.clone(),
        max_keys,
    };

    let result = service.list_objects_v2(&bucket, params.clone()).await?;
    let xml = build_list_objects_v2_xml(
        &bucket,
        &params,
        continuation_token_raw.as_deref(),
        start_after.as_deref(),
        &result,
    );

    Ok(xml_response(StatusCode::OK, xml))
}

/// PUT `/{bucket}` — create bucket.
///
/// The body is optional: an empty body means region "local", a JSON body
/// may carry a `LocationConstraint`. Unparseable bodies fall back to the
/// default rather than failing the create.
pub async fn create_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let region = parse_create_bucket_body(&body)
        .location_constraint
        .unwrap_or_else(|| "local".into());

    service.create_bucket(&bucket, region).await?;

    let xml = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<CreateBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">"#,
            r#"<Location>/{}</Location>"#,
            r#"</CreateBucketResult>"#
        ),
        xml_escape(&bucket)
    );
    Ok(xml_response(StatusCode::OK, xml))
}

/// DELETE `/{bucket}` — delete bucket (only when empty).
pub async fn delete_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    service.delete_bucket(&bucket).await?;
    Ok(StatusCode::OK)
}

/// GET `/` — enumerate all buckets.
pub async fn list_buckets(
    State(service): State<StorageService>,
) -> Result<Response, AppError> {
    let buckets = service.list_buckets().await?;
    Ok(xml_response(StatusCode::OK, build_list_buckets_xml(&buckets)))
}

/// Fallback for every method/path combination outside the supported set.
pub async fn not_implemented() -> Response {
    let xml = concat!(
        r#"<?xml version="1.0" encoding="UTF-8"?>"#,
        r#"<Error><Code>NotImplemented</Code>"#,
        r#"<Message>This operation is not supported by this server</Message>"#,
        r#"</Error>"#
    );
    xml_response(StatusCode::NOT_IMPLEMENTED, xml.to_string())
}

fn header_string(headers: &HeaderMap, name: &header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn parse_create_bucket_body(body: &[u8]) -> CreateBucketReq {
    if body.is_empty() {
        return CreateBucketReq::default();
    }
    serde_json::from_slice(body).unwrap_or_default()
}

fn xml_response(status: StatusCode, xml: String) -> Response {
    let mut response = Response::new(Body::from(xml));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    response
}

/// Attach the persisted metadata headers to a GET/HEAD response.
fn set_object_headers(headers: &mut HeaderMap, meta: &Object) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    if let Some(encoding) = meta.content_encoding.as_deref() {
        if let Ok(value) = HeaderValue::from_str(encoding) {
            headers.insert(header::CONTENT_ENCODING, value);
        }
    }

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&meta.size_bytes.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    if let Some(etag) = meta.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            headers.insert(header::ETAG, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}

fn build_list_buckets_xml(buckets: &[Bucket]) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?><ListAllMyBucketsResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><Buckets>"#,
    );
    for bucket in buckets {
        xml.push_str("<Bucket>");
        xml.push_str(&format!("<Name>{}</Name>", xml_escape(&bucket.name)));
        xml.push_str(&format!(
            "<CreationDate>{}</CreationDate>",
            bucket.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        ));
        xml.push_str("</Bucket>");
    }
    xml.push_str("</Buckets></ListAllMyBucketsResult>");
    xml
}

fn build_list_objects_v2_xml(
    bucket: &str,
    params: &ListObjectsParams,
    continuation_token: Option<&str>,
    start_after: Option<&str>,
    result: &ListObjectsResult,
) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?><ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">"#,
    );
    xml.push_str(&format!("<Name>{}</Name>", xml_escape(bucket)));
    xml.push_str(&format!(
        "<Prefix>{}</Prefix>",
        xml_escape(params.prefix.as_deref().unwrap_or(""))
    ));
    xml.push_str(&format!("<MaxKeys>{}</MaxKeys>", params.max_keys));
    xml.push_str(&format!("<KeyCount>{}</KeyCount>", result.key_count));
    if let Some(token) = continuation_token {
        xml.push_str(&format!(
            "<ContinuationToken>{}</ContinuationToken>",
            xml_escape(token)
        ));
    }
    if let Some(sa) = start_after {
        xml.push_str(&format!("<StartAfter>{}</StartAfter>", xml_escape(sa)));
    }
    if let Some(delim) = &params.delimiter {
        xml.push_str(&format!("<Delimiter>{}</Delimiter>", xml_escape(delim)));
    }
    xml.push_str(&format!(
        "<IsTruncated>{}</IsTruncated>",
        if result.is_truncated { "true" } else { "false" }
    ));
    if let Some(next) = &result.next_continuation_token {
        let encoded = encode_continuation_token(next);
        xml.push_str(&format!(
            "<NextContinuationToken>{}</NextContinuationToken>",
            xml_escape(&encoded)
        ));
    }

    for obj in &result.objects {
        xml.push_str("<Contents>");
        xml.push_str(&format!("<Key>{}</Key>", xml_escape(&obj.key)));
        xml.push_str(&format!(
            "<LastModified>{}</LastModified>",
            obj.last_modified
                .to_rfc3339_opts(SecondsFormat::Millis, true)
        ));
        let etag = obj.etag.as_deref().unwrap_or("");
        xml.push_str(&format!("<ETag>\"{}\"</ETag>", xml_escape(etag)));
        xml.push_str(&format!("<Size>{}</Size>", obj.size_bytes));
        xml.push_str("<StorageClass>STANDARD</StorageClass>");
        xml.push_str("</Contents>");
    }

    for prefix in &result.common_prefixes {
        xml.push_str("<CommonPrefixes><Prefix>");
        xml.push_str(&xml_escape(prefix));
        xml.push_str("</Prefix></CommonPrefixes>");
    }

    xml.push_str("</ListBucketResult>");
    xml
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn encode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD.encode(token)
}

fn decode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xml_escape_covers_the_five_special_characters() {
        assert_eq!(
            xml_escape(r#"a&b<c>d"e'f"#),
            "a&amp;b&lt;c&gt;d&quot;e&apos;f"
        );
    }

    #[test]
    fn continuation_tokens_round_trip_through_base64() {
        let token = "photos/2025/img.jpg";
        assert_eq!(
            decode_continuation_token(&encode_continuation_token(token)),
            token
        );
    }

    #[test]
    fn create_bucket_body_is_optional_and_lenient() {
        assert!(parse_create_bucket_body(b"").location_constraint.is_none());
        assert_eq!(
            parse_create_bucket_body(br#"{"LocationConstraint":"us-east-1"}"#)
                .location_constraint
                .as_deref(),
            Some("us-east-1")
        );
        assert!(
            parse_create_bucket_body(b"<CreateBucketConfiguration/>")
                .location_constraint
                .is_none()
        );
    }
}

//! HTTP surface of a node
//!
//! Every path not listed below is a file request handed to the
//! [crate::coordinator::Coordinator]. Cached content honours single byte
//! ranges and conditional GETs on `ETag` and `Last-Modified`:
//! - `GET /_log` serves the durable log file (master, when it has one)
//! - `GET /_peers` describes this node's view of the group

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use log::{error, warn};
use serde::Serialize;

use crate::app_data::AppData;
use crate::config::Role;
use crate::coordinator::{FileRequest, FileResponse};
use crate::origin::CachedResponse;
use crate::telemetry::{REPORT_DATA_HEADER, REPORT_TYPE_HEADER};

pub fn router(app_data: Arc<AppData>) -> Router {
    Router::new()
        .route("/_log", get(log_file))
        .route("/_peers", get(peers))
        .fallback(file)
        .with_state(app_data)
}

/// Headers that only make sense on the origin's connection
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn file_request(request: &Request) -> FileRequest {
    let headers = request.headers();
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    FileRequest {
        path: request.uri().path().to_string(),
        query: request.uri().query().map(str::to_string),
        remote_addr,
        user_agent: header_string(headers, header::USER_AGENT.as_str()),
        header_data: header_string(headers, REPORT_DATA_HEADER),
        header_type: header_string(headers, REPORT_TYPE_HEADER),
    }
}

async fn file(State(app_data): State<Arc<AppData>>, request: Request) -> Response {
    if app_data.state.is_closed() {
        return (StatusCode::SERVICE_UNAVAILABLE, "closing").into_response();
    }
    let _work = app_data.state.begin_work();

    let file_request = file_request(&request);
    match app_data.coordinator.serve(&file_request).await {
        Ok(FileResponse::Redirect(location)) => {
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
        Ok(FileResponse::Content(cached)) => content(cached, request.headers()),
        Err(err) => {
            warn!(key:% = file_request.path, error:% = err; "File request failed");
            let status = StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, err.detail()).into_response()
        }
    }
}

/// Replays every cached header value in front of the cached body, or the
/// part of it the request asked for
fn content(cached: CachedResponse, request: &HeaderMap) -> Response {
    let mut headers = HeaderMap::new();
    for (name, values) in cached.header {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        if name == header::CONTENT_LENGTH || is_hop_by_hop(&name) {
            continue;
        }
        for value in values {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.append(name.clone(), value);
            }
        }
    }
    // origins without one are stamped with the serving time
    if !headers.contains_key(header::LAST_MODIFIED) {
        if let Ok(value) = HeaderValue::from_str(&http_date(Utc::now())) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    if not_modified(request, &headers) {
        headers.remove(header::CONTENT_TYPE);
        headers.remove(header::CONTENT_ENCODING);
        return (StatusCode::NOT_MODIFIED, headers).into_response();
    }

    let len = cached.body.len();
    let range = match header_str(request, &header::RANGE) {
        Some(spec) if range_applies(request, &headers) => byte_range(spec, len),
        _ => RangeRequest::Full,
    };
    match range {
        RangeRequest::Full => (headers, cached.body).into_response(),
        RangeRequest::Partial(range) => {
            let content_range = format!("bytes {}-{}/{}", range.start, range.end, len);
            if let Ok(value) = HeaderValue::from_str(&content_range) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            let body = cached.body[range.start..=range.end].to_vec();
            (StatusCode::PARTIAL_CONTENT, headers, body).into_response()
        }
        RangeRequest::Unsatisfiable => {
            headers.remove(header::CONTENT_TYPE);
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", len)) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            (StatusCode::RANGE_NOT_SATISFIABLE, headers, "invalid range").into_response()
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// IMF-fixdate, the only date format servers send
fn http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

/// Weak comparison, `*` matches any representation
fn etag_matches(candidates: &str, etag: Option<&str>) -> bool {
    if candidates.trim() == "*" {
        return true;
    }
    let Some(etag) = etag.map(|etag| etag.trim_start_matches("W/")) else {
        return false;
    };
    candidates
        .split(',')
        .any(|candidate| candidate.trim().trim_start_matches("W/") == etag)
}

/// `If-None-Match` wins over `If-Modified-Since` when both are sent
fn not_modified(request: &HeaderMap, response: &HeaderMap) -> bool {
    if let Some(candidates) = header_str(request, &header::IF_NONE_MATCH) {
        return etag_matches(candidates, header_str(response, &header::ETAG));
    }
    let since = header_str(request, &header::IF_MODIFIED_SINCE).and_then(parse_http_date);
    let modified = header_str(response, &header::LAST_MODIFIED).and_then(parse_http_date);
    match (since, modified) {
        (Some(since), Some(modified)) => modified <= since,
        _ => false,
    }
}

/// A `Range` guarded by `If-Range` is only honoured while the validator
/// still matches, otherwise the whole body is sent
fn range_applies(request: &HeaderMap, response: &HeaderMap) -> bool {
    let Some(validator) = header_str(request, &header::IF_RANGE) else {
        return true;
    };
    if validator.starts_with('"') {
        return header_str(response, &header::ETAG) == Some(validator);
    }
    match (
        parse_http_date(validator),
        header_str(response, &header::LAST_MODIFIED).and_then(parse_http_date),
    ) {
        (Some(validator), Some(modified)) => validator == modified,
        _ => false,
    }
}

/// Inclusive bounds within the body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByteRange {
    start: usize,
    end: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum RangeRequest {
    Full,
    Partial(ByteRange),
    Unsatisfiable,
}

/// Reads a `Range` header against a body of `len` bytes. Multiple ranges
/// are answered with the whole body
fn byte_range(spec: &str, len: usize) -> RangeRequest {
    let Some(ranges) = spec.trim().strip_prefix("bytes=") else {
        return RangeRequest::Unsatisfiable;
    };
    if ranges.contains(',') {
        return RangeRequest::Full;
    }
    let Some((start, end)) = ranges.split_once('-') else {
        return RangeRequest::Unsatisfiable;
    };
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        // suffix, the last `end` bytes
        return match end.parse::<usize>() {
            Ok(suffix) if suffix > 0 && len > 0 => RangeRequest::Partial(ByteRange {
                start: len - suffix.min(len),
                end: len - 1,
            }),
            _ => RangeRequest::Unsatisfiable,
        };
    }
    let start = match start.parse::<usize>() {
        Ok(start) if start < len => start,
        _ => return RangeRequest::Unsatisfiable,
    };
    let end = if end.is_empty() {
        len - 1
    } else {
        match end.parse::<usize>() {
            Ok(end) if end >= start => end.min(len - 1),
            _ => return RangeRequest::Unsatisfiable,
        }
    };
    RangeRequest::Partial(ByteRange { start, end })
}

async fn log_file(State(app_data): State<Arc<AppData>>) -> Response {
    let Some(path) = app_data.log_sink.path() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match tokio::fs::read(path).await {
        Ok(content) => (
            [(header::CONTENT_TYPE, "application/x-ndjson")],
            content,
        )
            .into_response(),
        Err(err) => {
            error!(path:? = path, error:% = err; "Could not read the log file");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct PeersView {
    role: Role,
    #[serde(rename = "self")]
    self_name: Option<String>,
    peers: Vec<String>,
    mirror: Option<String>,
}

async fn peers(State(app_data): State<Arc<AppData>>) -> Json<PeersView> {
    Json(PeersView {
        role: app_data.role,
        self_name: app_data.self_name(),
        peers: app_data.ring.members(),
        mirror: app_data.mirror.get().map(|url| url.to_string()),
    })
}

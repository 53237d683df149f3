//! Translation between the live request and the wire request
//!
//! `create_plugin_request` snapshots a live request for a plugin call, and
//! `sync_request` / `sync_response_headers` copy a plugin's reply back onto
//! the live request and response. Malformed input on either side is logged
//! and replaced with a safe default; it never fails the transaction.

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Method, Uri};
use tracing::{debug, error, warn};

use crate::http::request::{request_uri_of, version_from_parts, version_parts};
use crate::http::{ProxyRequest, RequestBody, ResponseWriter};
use crate::plugin::schema::{
    headers_from_values, merge_headers, parse_query, parse_query_bytes, values_from_headers,
    ValueMap, WireHttpResponse, WireRequest,
};

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Snapshot `req` for a plugin call tagged with `request_id`.
///
/// Reading the body drains a streaming body; it is stored back on `req` so
/// the rest of the chain still sees it. Trailers arrive with the body.
pub async fn create_plugin_request(req: &mut ProxyRequest, request_id: &str) -> WireRequest {
    let body = match req.read_body().await {
        Ok(body) => body,
        Err(e) => {
            error!(request_id, error = %e, "Unable to read request body");
            Bytes::new()
        }
    };

    let form_values = match parse_query(req.uri.query().unwrap_or("")) {
        Ok(values) => values,
        Err(e) => {
            debug!(request_id, error = %e, "Ignoring malformed query string");
            ValueMap::new()
        }
    };

    let post_form_values = if has_form_body(req) {
        parse_form_body(&body, request_id)
    } else {
        ValueMap::new()
    };

    let (proto_major, proto_minor) = version_parts(req.version);

    WireRequest {
        request_id: request_id.to_string(),
        method: req.method.to_string(),
        url: req.uri.to_string(),
        proto: req.proto().to_string(),
        proto_major,
        proto_minor,
        host: req.host.clone(),
        remote_addr: req.remote_addr.clone(),
        request_uri: req.request_uri.clone(),
        close: req.close,
        content_length: req
            .content_length
            .and_then(|len| i64::try_from(len).ok())
            .unwrap_or(-1),
        transfer_encoding: req.transfer_encoding.clone(),
        header: values_from_headers(&req.headers),
        form_values,
        post_form_values,
        trailer: values_from_headers(&req.trailers),
        body,
    }
}

/// POST/PUT/PATCH with a URL-encoded form content type (parameters ignored)
fn has_form_body(req: &ProxyRequest) -> bool {
    if !matches!(req.method, Method::POST | Method::PUT | Method::PATCH) {
        return false;
    }

    req.headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| ct.split(';').next())
        .map(|media_type| media_type.trim().eq_ignore_ascii_case(FORM_URLENCODED))
        .unwrap_or(false)
}

fn parse_form_body(body: &[u8], request_id: &str) -> ValueMap {
    match parse_query_bytes(body) {
        Ok(values) => values,
        Err(e) => {
            debug!(request_id, error = %e, "Ignoring malformed form body");
            ValueMap::new()
        }
    }
}

/// Overwrite the live request with the plugin's (possibly rewritten) copy.
///
/// A URL, method or protocol version that does not parse leaves the live
/// value unchanged.
pub fn sync_request(src: &WireRequest, dest: &mut ProxyRequest) {
    dest.close = src.close;
    dest.content_length = u64::try_from(src.content_length).ok();
    dest.form = src.form_values.clone();
    dest.body = RequestBody::Buffered(src.body.clone());
    dest.headers = headers_from_values(&src.header);
    dest.host = src.host.clone();
    dest.post_form = src.post_form_values.clone();
    dest.remote_addr = src.remote_addr.clone();
    dest.request_uri = src.request_uri.clone();
    dest.trailers = headers_from_values(&src.trailer);
    dest.transfer_encoding = src.transfer_encoding.clone();

    match Method::from_bytes(src.method.as_bytes()) {
        Ok(method) => dest.method = method,
        Err(e) => warn!(method = %src.method, error = %e, "Unable to sync request method"),
    }

    match version_from_parts(src.proto_major, src.proto_minor) {
        Some(version) => dest.version = version,
        None => warn!(
            major = src.proto_major,
            minor = src.proto_minor,
            "Unable to sync request protocol version"
        ),
    }

    match parse_request_uri(&src.url) {
        Some(uri) => dest.uri = uri,
        None => error!(url = %src.url, "Unable to sync request url field"),
    }
}

/// Merge the plugin's response headers into the live response
pub fn sync_response_headers(src: &WireHttpResponse, rw: &mut dyn ResponseWriter) {
    let headers = headers_from_values(&src.header);
    merge_headers(rw.headers_mut(), &headers);
}

/// Parse a request-URI: an absolute URL or an absolute path
pub fn parse_request_uri(raw: &str) -> Option<Uri> {
    let uri: Uri = raw.parse().ok()?;
    if uri.scheme().is_some() || raw.starts_with('/') {
        Some(uri)
    } else {
        None
    }
}

/// Point `req` at a new target and keep its request-URI consistent
pub fn retarget(req: &mut ProxyRequest, uri: Uri) {
    req.request_uri = request_uri_of(&uri);
    req.uri = uri;
}

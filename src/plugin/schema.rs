//! Plugin wire schema definitions and conversions
//!
//! This module defines the envelopes exchanged with remote plugins over the
//! RPC channel, and the helpers that translate between the proxy's live
//! header maps and the ordered multimap form used on the wire.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

/// Multimap of string keys to ordered values (headers, query and form values)
pub type ValueMap = HashMap<String, Vec<String>>;

/// Snapshot of an HTTP request as it crosses the plugin boundary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireRequest {
    /// Correlation id shared by every remote call of one transaction
    pub request_id: String,

    pub method: String,

    pub url: String,

    /// Protocol string, e.g. `HTTP/1.1`
    pub proto: String,

    pub proto_major: u32,

    pub proto_minor: u32,

    pub host: String,

    pub remote_addr: String,

    pub request_uri: String,

    pub close: bool,

    /// `-1` when the length is unknown
    pub content_length: i64,

    pub transfer_encoding: Vec<String>,

    pub header: ValueMap,

    /// Values parsed from the URL query string
    pub form_values: ValueMap,

    /// Values parsed from a URL-encoded POST/PUT/PATCH body
    pub post_form_values: ValueMap,

    pub trailer: ValueMap,

    #[serde(with = "base64_bytes")]
    pub body: Bytes,
}

/// Response payload a plugin wants rendered
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireHttpResponse {
    /// `0` means the plugin left the status unset
    pub status_code: u16,

    pub header: ValueMap,

    #[serde(with = "base64_bytes")]
    pub body: Bytes,
}

/// Reply of a plugin to one `ServeHTTP` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResponse {
    /// The request, possibly rewritten by the plugin
    pub request: WireRequest,

    pub response: WireHttpResponse,

    /// Forward the rewritten request to its URL
    #[serde(default)]
    pub redirect: bool,

    /// Render the response body as the final answer
    #[serde(default)]
    pub render_content: bool,

    /// Skip the rest of the handler chain
    #[serde(default)]
    pub stop_chain: bool,
}

impl WireResponse {
    /// Reply that echoes the request unchanged and lets the chain continue
    pub fn pass_through(request: WireRequest) -> Self {
        Self {
            request,
            response: WireHttpResponse {
                status_code: 200,
                ..Default::default()
            },
            redirect: false,
            render_content: false,
            stop_chain: false,
        }
    }
}

/// Errors from strict query-string parsing
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("invalid semicolon separator in query")]
    InvalidSemicolon,

    #[error("invalid URL escape {0:?}")]
    InvalidEscape(String),
}

/// Canonical MIME form of a header key: `content-type` becomes `Content-Type`
pub fn canonical_header_key(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

/// Convert a live header map into the wire multimap, keeping value order
pub fn values_from_headers(headers: &HeaderMap) -> ValueMap {
    let mut values = ValueMap::with_capacity(headers.keys_len());
    for (name, value) in headers.iter() {
        values
            .entry(canonical_header_key(name.as_str()))
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    values
}

/// Convert a wire multimap back into a header map.
///
/// Names or values that are not valid HTTP are logged and dropped.
pub fn headers_from_values(values: &ValueMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(values.len());
    for (key, list) in values {
        let name = match HeaderName::from_bytes(key.as_bytes()) {
            Ok(name) => name,
            Err(e) => {
                warn!(header = %key, error = %e, "Skipping invalid header name from plugin");
                continue;
            }
        };
        for value in list {
            match HeaderValue::from_bytes(value.as_bytes()) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                }
                Err(e) => {
                    warn!(header = %key, error = %e, "Skipping invalid header value from plugin");
                }
            }
        }
    }
    headers
}

/// Merge `src` into `dest`: keys already present get the new values appended,
/// absent keys are set.
pub fn merge_headers(dest: &mut HeaderMap, src: &HeaderMap) {
    for name in src.keys() {
        let incoming = src.get_all(name).iter().cloned();
        if dest.contains_key(name) {
            for value in incoming {
                dest.append(name.clone(), value);
            }
        } else {
            let mut incoming = incoming;
            if let Some(first) = incoming.next() {
                dest.insert(name.clone(), first);
            }
            for value in incoming {
                dest.append(name.clone(), value);
            }
        }
    }
}

/// Parse a URL-encoded query string.
///
/// Unlike a lenient decoder this rejects `;` separators and malformed
/// percent escapes, so callers can tell a malformed query apart.
pub fn parse_query(raw: &str) -> Result<ValueMap, QueryError> {
    parse_query_bytes(raw.as_bytes())
}

/// `parse_query` over raw bytes, e.g. a form body that is not valid UTF-8.
/// Invalid UTF-8 in decoded keys and values is replaced, not rejected.
pub fn parse_query_bytes(bytes: &[u8]) -> Result<ValueMap, QueryError> {
    if bytes.contains(&b';') {
        return Err(QueryError::InvalidSemicolon);
    }

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.len() >= i + 3
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                let end = (i + 3).min(bytes.len());
                return Err(QueryError::InvalidEscape(
                    String::from_utf8_lossy(&bytes[i..end]).into_owned(),
                ));
            }
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut values = ValueMap::new();
    for (key, value) in url::form_urlencoded::parse(bytes) {
        values
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    Ok(values)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

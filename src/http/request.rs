use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Uri, Version};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use std::mem;
use std::net::SocketAddr;

use crate::plugin::schema::ValueMap;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request body as seen by middlewares.
///
/// A `Buffered` body can be read any number of times. A `Streaming` body is
/// read once; after the first read it is replaced by the captured bytes.
pub enum RequestBody {
    Buffered(Bytes),
    Streaming(UnsyncBoxBody<Bytes, BoxError>),
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::Buffered(Bytes::new())
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            Self::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

impl RequestBody {
    pub fn streaming<B>(body: B) -> Self
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self::Streaming(body.map_err(Into::into).boxed_unsync())
    }

    /// Returns the body bytes without consuming anything, if the body is replayable
    pub fn replayable(&self) -> Option<Bytes> {
        match self {
            Self::Buffered(bytes) => Some(bytes.clone()),
            Self::Streaming(_) => None,
        }
    }

    /// Read the whole body.
    ///
    /// A streaming body is drained and stored back as a buffered body. If the
    /// stream fails the body is left empty.
    pub async fn read_all(&mut self) -> Result<Bytes, BoxError> {
        self.read_with_trailers().await.map(|(bytes, _)| bytes)
    }

    /// Read the whole body along with any trailers it carried.
    ///
    /// Trailers are only returned by the read that drains a streaming body.
    pub async fn read_with_trailers(&mut self) -> Result<(Bytes, Option<HeaderMap>), BoxError> {
        match mem::take(self) {
            Self::Streaming(stream) => {
                let collected = stream.collect().await?;
                let trailers = collected.trailers().cloned();
                let bytes = collected.to_bytes();
                *self = Self::Buffered(bytes.clone());
                Ok((bytes, trailers))
            }
            Self::Buffered(bytes) => {
                *self = Self::Buffered(bytes.clone());
                Ok((bytes, None))
            }
        }
    }
}

/// The proxy's mutable view of an in-flight HTTP request
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    /// Host the request was addressed to (Host header or URI authority)
    pub host: String,
    /// Peer address of the client, `ip:port`
    pub remote_addr: String,
    /// Unmodified request-target as sent by the client
    pub request_uri: String,
    /// Whether the connection should be closed after this request
    pub close: bool,
    /// `None` when the length is unknown
    pub content_length: Option<u64>,
    pub transfer_encoding: Vec<String>,
    pub trailers: HeaderMap,
    /// Parsed query values
    pub form: ValueMap,
    /// Parsed URL-encoded body values
    pub post_form: ValueMap,
    pub body: RequestBody,
}

impl ProxyRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        let host = uri.authority().map(|a| a.to_string()).unwrap_or_default();
        let request_uri = request_uri_of(&uri);

        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            host,
            remote_addr: String::new(),
            request_uri,
            close: false,
            content_length: Some(0),
            transfer_encoding: Vec::new(),
            trailers: HeaderMap::new(),
            form: ValueMap::new(),
            post_form: ValueMap::new(),
            body: RequestBody::default(),
        }
    }

    /// Replace the body with buffered bytes and update the content length
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.content_length = Some(body.len() as u64);
        self.body = RequestBody::Buffered(body);
        self
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = addr.into();
        self
    }

    /// Build from a request accepted by the HTTP server
    pub fn from_http<B>(req: http::Request<B>, remote_addr: SocketAddr) -> Self
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();

        let host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();

        let close = parts
            .headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("close"));

        let content_length = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        let transfer_encoding = parts
            .headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|token| token.trim().to_ascii_lowercase())
            .filter(|token| !token.is_empty())
            .collect();

        Self {
            method: parts.method,
            request_uri: request_uri_of(&parts.uri),
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            host,
            remote_addr: remote_addr.to_string(),
            close,
            content_length,
            transfer_encoding,
            trailers: HeaderMap::new(),
            form: ValueMap::new(),
            post_form: ValueMap::new(),
            body: RequestBody::streaming(body),
        }
    }

    /// Protocol string, e.g. `HTTP/1.1`
    pub fn proto(&self) -> &'static str {
        match self.version {
            Version::HTTP_09 => "HTTP/0.9",
            Version::HTTP_10 => "HTTP/1.0",
            Version::HTTP_2 => "HTTP/2.0",
            Version::HTTP_3 => "HTTP/3.0",
            _ => "HTTP/1.1",
        }
    }

    /// Read the whole body, recording trailers that arrive with it
    pub async fn read_body(&mut self) -> Result<Bytes, BoxError> {
        let (bytes, trailers) = self.body.read_with_trailers().await?;
        if let Some(trailers) = trailers {
            for (name, value) in &trailers {
                self.trailers.append(name.clone(), value.clone());
            }
        }
        Ok(bytes)
    }
}

/// Origin-form request target (`/path?query`) of a URI
pub fn request_uri_of(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .filter(|pq| !pq.is_empty())
        .unwrap_or_else(|| "/".to_string())
}

pub fn version_parts(version: Version) -> (u32, u32) {
    match version {
        Version::HTTP_09 => (0, 9),
        Version::HTTP_10 => (1, 0),
        Version::HTTP_2 => (2, 0),
        Version::HTTP_3 => (3, 0),
        _ => (1, 1),
    }
}

pub fn version_from_parts(major: u32, minor: u32) -> Option<Version> {
    match (major, minor) {
        (0, 9) => Some(Version::HTTP_09),
        (1, 0) => Some(Version::HTTP_10),
        (1, 1) => Some(Version::HTTP_11),
        (2, _) => Some(Version::HTTP_2),
        (3, _) => Some(Version::HTTP_3),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::Frame;
    use http_body_util::{Full, StreamBody};
    use std::convert::Infallible;

    #[tokio::test]
    async fn test_streaming_body_becomes_replayable() {
        let mut body = RequestBody::streaming(Full::new(Bytes::from_static(b"payload")));
        assert!(body.replayable().is_none());

        let first = body.read_all().await.unwrap();
        assert_eq!(&first[..], b"payload");

        // Second read sees the same bytes
        assert_eq!(body.replayable().unwrap(), first);
        assert_eq!(body.read_all().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_read_body_records_trailers() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", http::HeaderValue::from_static("abc"));
        let frames = vec![
            Ok::<_, Infallible>(Frame::data(Bytes::from_static(b"hi"))),
            Ok(Frame::trailers(trailers)),
        ];

        let mut req = ProxyRequest::new(Method::POST, "/upload".parse().unwrap());
        req.body = RequestBody::streaming(StreamBody::new(futures::stream::iter(frames)));

        let body = req.read_body().await.unwrap();
        assert_eq!(&body[..], b"hi");
        assert_eq!(req.trailers.get("x-checksum").unwrap(), "abc");

        // A second read finds the buffered body and leaves trailers alone
        assert_eq!(req.read_body().await.unwrap(), body);
        assert_eq!(req.trailers.len(), 1);
    }

    #[test]
    fn test_from_http_captures_connection_details() {
        let req = http::Request::builder()
            .method("POST")
            .uri("/submit?x=1")
            .header("Host", "example.com")
            .header("Connection", "keep-alive, close")
            .header("Content-Length", "5")
            .body(Full::new(Bytes::from_static(b"hello")))
            .unwrap();

        let proxy_req = ProxyRequest::from_http(req, "10.0.0.1:4000".parse().unwrap());

        assert_eq!(proxy_req.method, Method::POST);
        assert_eq!(proxy_req.host, "example.com");
        assert_eq!(proxy_req.request_uri, "/submit?x=1");
        assert_eq!(proxy_req.remote_addr, "10.0.0.1:4000");
        assert!(proxy_req.close);
        assert_eq!(proxy_req.content_length, Some(5));
        assert_eq!(proxy_req.proto(), "HTTP/1.1");
    }

    #[test]
    fn test_version_parts_round_trip() {
        for version in [Version::HTTP_10, Version::HTTP_11, Version::HTTP_2] {
            let (major, minor) = version_parts(version);
            assert_eq!(version_from_parts(major, minor), Some(version));
        }
        assert_eq!(version_from_parts(4, 2), None);
    }
}

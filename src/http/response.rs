use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use http_body_util::Full;
use tracing::debug;

/// Sink a handler writes its response into.
///
/// Mirrors the usual writer contract: the first `write_header` call fixes
/// the status, later calls are ignored, and writing body bytes without a
/// status implies `200 OK`.
pub trait ResponseWriter: Send {
    fn headers_mut(&mut self) -> &mut HeaderMap;

    fn write_header(&mut self, status: StatusCode);

    fn write(&mut self, data: &[u8]);

    /// Status written so far, if any
    fn status(&self) -> Option<StatusCode>;
}

/// Response sink that keeps everything in memory until the chain returns
#[derive(Debug, Default)]
pub struct BufferedResponse {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Status that will be sent, `200 OK` when nothing was written
    pub fn effective_status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    pub fn into_response(self) -> http::Response<Full<Bytes>> {
        let mut response = http::Response::new(Full::new(self.body.freeze()));
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = self.headers;
        response
    }
}

impl ResponseWriter for BufferedResponse {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        match self.status {
            Some(existing) => {
                debug!(
                    existing = existing.as_u16(),
                    ignored = status.as_u16(),
                    "Superfluous write_header call"
                );
            }
            None => self.status = Some(status),
        }
    }

    fn write(&mut self, data: &[u8]) {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.body.extend_from_slice(data);
    }

    fn status(&self) -> Option<StatusCode> {
        self.status
    }
}

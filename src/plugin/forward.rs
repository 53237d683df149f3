//! Reverse-proxy forwarding
//!
//! Used when a plugin asks for a redirect, and by the host to reach an entry
//! point's upstream. The forwarder sends the (possibly rewritten) request to
//! its target and copies the upstream answer into the response sink.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::http::request::request_uri_of;
use crate::http::{ProxyRequest, ResponseWriter};
use crate::plugin::PluginError;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Headers that describe one hop and must not be forwarded
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Completes a transaction by forwarding the request to its target
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, req: &mut ProxyRequest, rw: &mut dyn ResponseWriter);
}

/// Builds forwarders on demand; a build failure is not fatal to the caller
pub trait ForwarderFactory: Send + Sync {
    fn build(&self) -> Result<Arc<dyn Forwarder>, PluginError>;
}

/// Forwarder backed by a shared `reqwest` client
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(timeout: Option<Duration>) -> Result<Self, PluginError> {
        let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .build()
            .map_err(|e| PluginError::ForwarderUnavailable {
                reason: e.to_string(),
            })?;

        Ok(Self { client })
    }

    async fn send(&self, req: &mut ProxyRequest) -> Result<reqwest::Response, String> {
        let target = forward_target(req)?;
        let body = match req.read_body().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Unable to read request body for forwarding");
                Bytes::new()
            }
        };

        let mut headers = req.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        add_forwarded_headers(&mut headers, req);

        debug!(method = %req.method, target = %target, "Forwarding request");

        self.client
            .request(req.method.clone(), target)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, req: &mut ProxyRequest, rw: &mut dyn ResponseWriter) {
        let response = match self.send(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!(uri = %req.uri, error = %e, "Forwarding failed");
                bad_gateway(rw);
                return;
            }
        };

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                warn!(uri = %req.uri, error = %e, "Failed to read upstream response body");
                bad_gateway(rw);
                return;
            }
        };

        // Length is recomputed from the buffered body
        headers.remove(header::CONTENT_LENGTH);
        for (name, value) in headers.iter() {
            rw.headers_mut().append(name.clone(), value.clone());
        }
        rw.write_header(status);
        rw.write(&body);
    }
}

/// Lazily builds one `HttpForwarder` and hands out the cached instance
#[derive(Default)]
pub struct HttpForwarderFactory {
    timeout: Option<Duration>,
    cached: ArcSwapOption<HttpForwarder>,
}

impl HttpForwarderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cached: ArcSwapOption::empty(),
        }
    }
}

impl ForwarderFactory for HttpForwarderFactory {
    fn build(&self) -> Result<Arc<dyn Forwarder>, PluginError> {
        if let Some(forwarder) = self.cached.load_full() {
            return Ok(forwarder);
        }

        let forwarder = Arc::new(HttpForwarder::new(self.timeout)?);
        self.cached.store(Some(forwarder.clone()));
        Ok(forwarder)
    }
}

/// Absolute target of a request: its URI when absolute, else `http://{host}{request-uri}`
pub fn forward_target(req: &ProxyRequest) -> Result<reqwest::Url, String> {
    let raw = if req.uri.scheme().is_some() {
        req.uri.to_string()
    } else if !req.host.is_empty() {
        format!("http://{}{}", req.host, request_uri_of(&req.uri))
    } else {
        return Err(format!("no target host for '{}'", req.uri));
    };

    reqwest::Url::parse(&raw).map_err(|e| format!("invalid target '{raw}': {e}"))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in Connection are hop-by-hop too
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn add_forwarded_headers(headers: &mut HeaderMap, req: &ProxyRequest) {
    let client_ip = req
        .remote_addr
        .parse::<std::net::SocketAddr>()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| req.remote_addr.clone());

    if !client_ip.is_empty() {
        let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{prior}, {client_ip}"),
            None => client_ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if !req.host.is_empty() && !headers.contains_key(X_FORWARDED_HOST) {
        if let Ok(value) = HeaderValue::from_str(&req.host) {
            headers.insert(X_FORWARDED_HOST, value);
        }
    }
}

fn bad_gateway(rw: &mut dyn ResponseWriter) {
    let status = StatusCode::BAD_GATEWAY;
    rw.write_header(status);
    rw.write(status.canonical_reason().unwrap_or("Bad Gateway").as_bytes());
}

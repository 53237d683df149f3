use async_trait::async_trait;
use http::Uri;
use std::sync::Arc;
use tracing::warn;

use crate::error::{ConfigError, Result};
use crate::http::request::request_uri_of;
use crate::http::{ProxyRequest, ResponseWriter};
use crate::plugin::bridge::retarget;
use crate::plugin::forward::Forwarder;
use crate::plugin::middleware::Handler;

/// Terminal handler of an entry point: sends the request to the upstream
pub struct UpstreamHandler {
    base: String,
    forwarder: Arc<dyn Forwarder>,
}

impl UpstreamHandler {
    pub fn new(upstream: &str, forwarder: Arc<dyn Forwarder>) -> Result<Self> {
        let parsed = url::Url::parse(upstream).map_err(|e| {
            ConfigError::Validation(format!("invalid upstream URL '{upstream}': {e}"))
        })?;

        Ok(Self {
            base: parsed.as_str().trim_end_matches('/').to_string(),
            forwarder,
        })
    }

    /// Upstream URI for a request: upstream base followed by the request's path and query
    pub fn target_for(&self, req: &ProxyRequest) -> Option<Uri> {
        format!("{}{}", self.base, request_uri_of(&req.uri))
            .parse()
            .ok()
    }
}

#[async_trait]
impl Handler for UpstreamHandler {
    async fn serve(&self, req: &mut ProxyRequest, rw: &mut dyn ResponseWriter) {
        match self.target_for(req) {
            Some(target) => {
                retarget(req, target);
                self.forwarder.forward(req, rw).await;
            }
            None => {
                warn!(base = %self.base, uri = %req.uri, "Unable to build upstream target");
                rw.write_header(http::StatusCode::BAD_GATEWAY);
                rw.write(b"Bad Gateway");
            }
        }
    }
}

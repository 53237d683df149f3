//! Remote plugin adapter
//!
//! Represents one out-of-process plugin as a [`Middleware`]. Per transaction
//! the adapter calls the plugin before the next handler (`before`/`around`),
//! after it (`after`/`around`), or both, tagging every call of the
//! transaction with the same correlation id.
//!
//! A plugin reply is applied in a fixed order: the rewritten request and the
//! response headers are always synced first, then the first matching of
//! redirect, rendered content, or non-200 status writes the response and
//! stops the chain. Otherwise the plugin's `stop_chain` flag decides.

use async_trait::async_trait;
use http::StatusCode;
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::http::{ProxyRequest, ResponseWriter};
use crate::plugin::bridge::{
    create_plugin_request, parse_request_uri, retarget, sync_request, sync_response_headers,
};
use crate::plugin::declaration::PluginDeclaration;
use crate::plugin::forward::ForwarderFactory;
use crate::plugin::middleware::{Handler, Middleware};
use crate::plugin::schema::{WireHttpResponse, WireResponse};
use crate::plugin::PluginError;
use crate::rpc::{wait_ready, ConnectivityState, Dialer, PluginConnection, ReadyOutcome};

pub struct RemotePluginMiddleware {
    declaration: PluginDeclaration,
    connection: Arc<dyn PluginConnection>,
    forwarders: Arc<dyn ForwarderFactory>,
}

impl RemotePluginMiddleware {
    /// Dial the plugin at `declaration.path` and wait until the connection is
    /// ready. Dialing and the readiness wait share the declaration's timeout.
    pub async fn connect(
        declaration: PluginDeclaration,
        dialer: &dyn Dialer,
        forwarders: Arc<dyn ForwarderFactory>,
    ) -> Result<Self, PluginError> {
        if declaration.path.is_empty() {
            return Err(PluginError::MissingAddress {
                entry: declaration.entry_name.clone(),
            });
        }

        let load_failed = |reason: String| PluginError::LoadFailed {
            path: declaration.path.clone(),
            reason,
        };

        let deadline = Instant::now() + declaration.timeout();
        let connection = match timeout_at(deadline, dialer.dial(&declaration.path)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => return Err(load_failed(e.to_string())),
            Err(_) => {
                return Err(load_failed(format!(
                    "dial timed out after {}s",
                    declaration.timeout_seconds
                )))
            }
        };

        match wait_ready(connection.as_ref(), deadline).await {
            ReadyOutcome::Ready => {}
            ReadyOutcome::TimedOut => {
                connection.close();
                return Err(load_failed(format!(
                    "connection not ready after {}s",
                    declaration.timeout_seconds
                )));
            }
            ReadyOutcome::Canceled => {
                connection.close();
                return Err(load_failed(
                    "connection canceled before it became ready".to_string(),
                ));
            }
        }

        info!(
            plugin = %declaration.entry_name,
            address = %declaration.path,
            order = %declaration.order,
            "Remote plugin connected"
        );

        Ok(Self::from_connection(declaration, connection, forwarders))
    }

    /// Wrap an already established connection
    pub fn from_connection(
        declaration: PluginDeclaration,
        connection: Arc<dyn PluginConnection>,
        forwarders: Arc<dyn ForwarderFactory>,
    ) -> Self {
        Self {
            declaration,
            connection,
            forwarders,
        }
    }

    pub fn declaration(&self) -> &PluginDeclaration {
        &self.declaration
    }

    /// Call the plugin for one phase of a transaction.
    ///
    /// Returns `true` when the chain must be treated as terminated. A stopped
    /// plugin is skipped and returns `false`.
    pub async fn execute_remote(
        &self,
        req: &mut ProxyRequest,
        rw: &mut dyn ResponseWriter,
        request_id: &str,
        before: bool,
    ) -> bool {
        let phase = if before { "before" } else { "after" };

        if self.connection.state() == ConnectivityState::Shutdown {
            debug!(
                plugin = %self.declaration.entry_name,
                request_id,
                phase,
                "Plugin stopped, skipping call"
            );
            return false;
        }

        let plugin_request = create_plugin_request(req, request_id).await;
        debug!(
            plugin = %self.declaration.entry_name,
            request_id,
            phase,
            method = %plugin_request.method,
            url = %plugin_request.url,
            "Calling remote plugin"
        );

        match self.connection.serve_http(plugin_request).await {
            Ok(response) => {
                let stop_chain = self.handle_plugin_response(response, req, rw).await;
                debug!(
                    plugin = %self.declaration.entry_name,
                    request_id,
                    phase,
                    stop_chain,
                    "Remote plugin replied"
                );
                stop_chain
            }
            Err(e) => {
                warn!(
                    plugin = %self.declaration.entry_name,
                    request_id,
                    phase,
                    error = %e,
                    "Remote plugin call failed"
                );
                let status = StatusCode::SERVICE_UNAVAILABLE;
                rw.write_header(status);
                rw.write(status.canonical_reason().unwrap_or("Service Unavailable").as_bytes());
                true
            }
        }
    }

    /// Apply a plugin reply to the live request and response
    pub async fn handle_plugin_response(
        &self,
        response: WireResponse,
        req: &mut ProxyRequest,
        rw: &mut dyn ResponseWriter,
    ) -> bool {
        sync_request(&response.request, req);
        sync_response_headers(&response.response, rw);

        if response.redirect && self.redirect(&response, req, rw).await {
            return true;
        }

        let WireHttpResponse {
            status_code, body, ..
        } = &response.response;

        if response.render_content && !body.is_empty() {
            write_plugin_response(rw, *status_code, body);
            debug!(plugin = %self.declaration.entry_name, "Rendered plugin response body");
            return true;
        }

        if effective_status(*status_code) != StatusCode::OK.as_u16() {
            write_plugin_response(rw, *status_code, body);
            return true;
        }

        response.stop_chain
    }

    /// Forward the rewritten request to its URL. Returns `false` when the
    /// redirect could not be performed.
    async fn redirect(
        &self,
        response: &WireResponse,
        req: &mut ProxyRequest,
        rw: &mut dyn ResponseWriter,
    ) -> bool {
        let url = &response.request.url;
        let Some(target) = parse_request_uri(url) else {
            error!(
                plugin = %self.declaration.entry_name,
                url = %url,
                "Unable to parse redirect url"
            );
            return false;
        };

        let forwarder = match self.forwarders.build() {
            Ok(forwarder) => forwarder,
            Err(e) => {
                error!(
                    plugin = %self.declaration.entry_name,
                    url = %url,
                    error = %e,
                    "Unable to forward request"
                );
                return false;
            }
        };

        retarget(req, target);
        forwarder.forward(req, rw).await;
        debug!(plugin = %self.declaration.entry_name, url = %url, "Forwarded plugin response");
        true
    }
}

#[async_trait]
impl Middleware for RemotePluginMiddleware {
    fn name(&self) -> &str {
        &self.declaration.entry_name
    }

    async fn handle(
        &self,
        req: &mut ProxyRequest,
        rw: &mut dyn ResponseWriter,
        next: &dyn Handler,
    ) {
        let request_id = Uuid::new_v4().to_string();

        let mut stop_chain = false;
        if self.declaration.runs_before() {
            stop_chain = self.execute_remote(req, rw, &request_id, true).await;
        }

        if !stop_chain {
            debug!(
                plugin = %self.declaration.entry_name,
                request_id = %request_id,
                "Executing next handler"
            );
            next.serve(req, rw).await;
        }

        if self.declaration.runs_after() {
            self.execute_remote(req, rw, &request_id, false).await;
        }
    }

    fn stop(&self) {
        debug!(plugin = %self.declaration.entry_name, "Stopping remote plugin");
        self.connection.close();
    }
}

/// `0` means the plugin left the status unset
fn effective_status(code: u16) -> u16 {
    if code == 0 {
        StatusCode::OK.as_u16()
    } else {
        code
    }
}

fn write_plugin_response(rw: &mut dyn ResponseWriter, code: u16, body: &[u8]) {
    let status = match StatusCode::from_u16(effective_status(code)) {
        Ok(status) => status,
        Err(_) => {
            warn!(status = code, "Plugin returned an invalid status code");
            StatusCode::BAD_GATEWAY
        }
    };
    rw.write_header(status);
    rw.write(body);
}

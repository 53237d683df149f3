use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EntryPointConfig;
use crate::error::{ConfigError, ProxyError, Result};
use crate::http::{BoxError, BufferedResponse, ProxyRequest};
use crate::plugin::forward::HttpForwarder;
use crate::plugin::manager::{PluginManager, Registry};
use crate::plugin::middleware::Handler;
use crate::plugin::MiddlewareChain;
use crate::proxy::upstream::UpstreamHandler;

/// One named listener with its plugin chain and upstream
pub struct EntryPoint {
    name: String,
    address: SocketAddr,
    upstream: Arc<dyn Handler>,
    plugins: Option<Arc<PluginManager>>,
}

impl EntryPoint {
    pub fn new(
        name: impl Into<String>,
        config: &EntryPointConfig,
        plugins: Option<Arc<PluginManager>>,
    ) -> Result<Self> {
        let name = name.into();
        let address = config.address.parse().map_err(|_| {
            ConfigError::Validation(format!(
                "Entry point '{}' has invalid address '{}'",
                name, config.address
            ))
        })?;

        let forwarder = Arc::new(HttpForwarder::new(Some(config.forward_timeout()))?);
        let upstream = Arc::new(UpstreamHandler::new(&config.upstream, forwarder)?);

        Ok(Self::with_upstream(name, address, upstream, plugins))
    }

    /// Entry point with a custom terminal handler
    pub fn with_upstream(
        name: impl Into<String>,
        address: SocketAddr,
        upstream: Arc<dyn Handler>,
        plugins: Option<Arc<PluginManager>>,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            upstream,
            plugins,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.address)
            .await
            .map_err(|source| ProxyError::Bind {
                entry: self.name.clone(),
                address: self.address.to_string(),
                source,
            })
    }

    /// Run one request through the entry's middlewares and upstream
    pub async fn handle<B>(
        &self,
        req: http::Request<B>,
        remote_addr: SocketAddr,
    ) -> http::Response<Full<Bytes>>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let mut req = ProxyRequest::from_http(req, remote_addr);
        let mut rw = BufferedResponse::new();

        let chain = MiddlewareChain::new(
            self.plugins.middlewares_for(&self.name),
            self.upstream.clone(),
        );
        debug!(
            entry = %self.name,
            method = %req.method,
            uri = %req.uri,
            plugins = chain.len(),
            "Handling request"
        );
        chain.serve(&mut req, &mut rw).await;

        rw.into_response()
    }

    /// Accept connections on `listener` until `shutdown` is cancelled, then
    /// let open connections finish their current request
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let local = listener.local_addr()?;
        info!(entry = %self.name, address = %local, "Entry point listening");

        let mut connections = JoinSet::new();

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(entry = %self.name, error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            let entry = Arc::clone(&self);
            let shutdown = shutdown.clone();
            let io = TokioIo::new(stream);

            connections.spawn(async move {
                let service = service_fn(move |req| {
                    let entry = Arc::clone(&entry);
                    async move { Ok::<_, Infallible>(entry.handle(req, peer).await) }
                });

                let conn = http1::Builder::new().serve_connection(io, service);
                tokio::pin!(conn);

                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    _ = shutdown.cancelled() => {
                        conn.as_mut().graceful_shutdown();
                        conn.await
                    }
                };

                if let Err(e) = result {
                    debug!(%peer, error = %e, "Connection error");
                }
            });

            // Reap finished connections
            while connections.try_join_next().is_some() {}
        }

        debug!(entry = %self.name, open = connections.len(), "Draining connections");
        while connections.join_next().await.is_some() {}

        info!(entry = %self.name, "Entry point stopped");
        Ok(())
    }
}

//! End-to-end tests for remote plugins
//!
//! Each test runs real loopback servers: an echo backend behind an entry
//! point, and a plugin process served over the line-delimited RPC transport.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderValue, StatusCode};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use remote_plugin_proxy::config::EntryPointConfig;
use remote_plugin_proxy::http::{ProxyRequest, ResponseWriter};
use remote_plugin_proxy::plugin::{
    Handler, HttpForwarderFactory, Middleware, MiddlewareChain, PluginDeclaration, PluginError,
    PluginKind, PluginManager, PluginOrder, RemotePluginMiddleware, WireRequest, WireResponse,
};
use remote_plugin_proxy::proxy::EntryPoint;
use remote_plugin_proxy::rpc::{
    self, wait_ready, ConnectivityState, PluginConnection, PluginFn, ReadyOutcome, RemoteError,
    TcpChannel,
};

const FORM_BODY: &str = r#"data={"siid":"MIOffice-5G"}"#;

/// Backend that echoes the request line, content type and body
#[derive(Default)]
struct Echo {
    hits: AtomicUsize,
}

impl Echo {
    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for Echo {
    async fn serve(&self, req: &mut ProxyRequest, rw: &mut dyn ResponseWriter) {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let body = req.read_body().await.unwrap_or_default();
        let content_type = req
            .headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        rw.headers_mut().insert(
            "x-echo-content-type",
            HeaderValue::from_str(&content_type).unwrap(),
        );
        rw.write_header(StatusCode::OK);
        rw.write(format!("{} {}\n", req.method, req.request_uri).as_bytes());
        rw.write(&body);
    }
}

struct Server {
    address: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_entry(entry: EntryPoint) -> Server {
    let entry = Arc::new(entry);
    let listener = entry.bind().await.unwrap();
    let address = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(entry.serve(listener, shutdown.clone()));
    Server { address, shutdown }
}

async fn start_backend(echo: Arc<Echo>) -> Server {
    start_entry(EntryPoint::with_upstream(
        "backend",
        "127.0.0.1:0".parse().unwrap(),
        echo,
        None,
    ))
    .await
}

async fn start_front(backend: SocketAddr, plugins: Option<Arc<PluginManager>>) -> Server {
    let config = EntryPointConfig {
        address: "127.0.0.1:0".to_string(),
        upstream: format!("http://{backend}"),
        forward_timeout_secs: 5,
    };
    start_entry(EntryPoint::new("web", &config, plugins).unwrap()).await
}

async fn start_plugin<F>(plugin: F) -> (String, CancellationToken)
where
    F: Fn(WireRequest) -> Result<WireResponse, RemoteError> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let shutdown = CancellationToken::new();
    tokio::spawn(rpc::serve(listener, Arc::new(PluginFn(plugin)), shutdown.clone()));
    (address, shutdown)
}

async fn load_plugin(address: &str, order: PluginOrder) -> Arc<PluginManager> {
    let manager = Arc::new(PluginManager::new());
    manager
        .load(
            PluginDeclaration::new("web", address, PluginKind::RemoteProcedure, order)
                .with_timeout(5),
        )
        .await
        .unwrap();
    manager
}

fn form_rewrite(mut request: WireRequest) -> WireResponse {
    request.body = Bytes::from_static(FORM_BODY.as_bytes());
    request.content_length = FORM_BODY.len() as i64;
    request.header.insert(
        "Content-Length".to_string(),
        vec![FORM_BODY.len().to_string()],
    );
    request.header.insert(
        "Content-Type".to_string(),
        vec!["application/x-www-form-urlencoded".to_string()],
    );
    WireResponse::pass_through(request)
}

#[tokio::test]
async fn test_around_plugin_rewrites_request_before_upstream() {
    let echo = Arc::new(Echo::default());
    let backend = start_backend(echo.clone()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let (plugin_address, _plugin) = start_plugin(move |request: WireRequest| {
        recorder.lock().unwrap().push(request.request_id.clone());
        Ok(form_rewrite(request))
    })
    .await;

    let manager = load_plugin(&plugin_address, PluginOrder::Around).await;
    let front = start_front(backend.address, Some(manager.clone())).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/submit?x=1", front.address))
        .body("original body")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers()["x-echo-content-type"],
        "application/x-www-form-urlencoded"
    );
    let body = response.text().await.unwrap();
    assert_eq!(body, format!("POST /submit?x=1\n{FORM_BODY}"));
    assert_eq!(echo.hits(), 1);

    // Before and after calls share the transaction's correlation id
    let ids = seen.lock().unwrap().clone();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[0], ids[1]);
    assert!(!ids[0].is_empty());

    manager.shutdown();
}

#[tokio::test]
async fn test_rendered_plugin_response_short_circuits_upstream() {
    let echo = Arc::new(Echo::default());
    let backend = start_backend(echo.clone()).await;

    let (plugin_address, _plugin) = start_plugin(|request: WireRequest| {
        let mut response = WireResponse::pass_through(request);
        response.render_content = true;
        response.response.status_code = 403;
        response.response.body = Bytes::from_static(b"denied");
        response
            .response
            .header
            .insert("X-Plugin".to_string(), vec!["deny".to_string()]);
        Ok(response)
    })
    .await;

    let manager = load_plugin(&plugin_address, PluginOrder::Before).await;
    let front = start_front(backend.address, Some(manager.clone())).await;

    let response = reqwest::get(format!("http://{}/private", front.address))
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    assert_eq!(response.headers()["x-plugin"], "deny");
    assert_eq!(response.text().await.unwrap(), "denied");
    assert_eq!(echo.hits(), 0);

    manager.shutdown();
}

#[tokio::test]
async fn test_plugin_headers_merge_into_upstream_response() {
    let echo = Arc::new(Echo::default());
    let backend = start_backend(echo.clone()).await;

    let (plugin_address, _plugin) = start_plugin(|request: WireRequest| {
        let mut response = WireResponse::pass_through(request);
        response
            .response
            .header
            .insert("X-Plugin-Trace".to_string(), vec!["abc".to_string()]);
        Ok(response)
    })
    .await;

    let manager = load_plugin(&plugin_address, PluginOrder::Before).await;
    let front = start_front(backend.address, Some(manager.clone())).await;

    let response = reqwest::get(format!("http://{}/page", front.address))
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers()["x-plugin-trace"], "abc");
    assert_eq!(response.text().await.unwrap(), "GET /page\n");
    assert_eq!(echo.hits(), 1);

    manager.shutdown();
}

#[tokio::test]
async fn test_plugin_redirect_forwards_to_rewritten_url() {
    let upstream = Arc::new(Echo::default());
    let upstream_server = start_backend(upstream.clone()).await;
    let elsewhere = Arc::new(Echo::default());
    let elsewhere_server = start_backend(elsewhere.clone()).await;

    let target = format!("http://{}/moved?from=plugin", elsewhere_server.address);
    let (plugin_address, _plugin) = start_plugin(move |mut request: WireRequest| {
        request.url = target.clone();
        let mut response = WireResponse::pass_through(request);
        response.redirect = true;
        Ok(response)
    })
    .await;

    let manager = load_plugin(&plugin_address, PluginOrder::Before).await;
    let front = start_front(upstream_server.address, Some(manager.clone())).await;

    let response = reqwest::get(format!("http://{}/original", front.address))
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "GET /moved?from=plugin\n");
    assert_eq!(elsewhere.hits(), 1);
    assert_eq!(upstream.hits(), 0);

    manager.shutdown();
}

#[tokio::test]
async fn test_plugin_error_yields_service_unavailable() {
    let echo = Arc::new(Echo::default());
    let backend = start_backend(echo.clone()).await;

    let (plugin_address, _plugin) =
        start_plugin(|_request: WireRequest| Err(RemoteError("boom".to_string()))).await;

    let manager = load_plugin(&plugin_address, PluginOrder::Before).await;
    let front = start_front(backend.address, Some(manager.clone())).await;

    let response = reqwest::get(format!("http://{}/", front.address))
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.text().await.unwrap(), "Service Unavailable");
    assert_eq!(echo.hits(), 0);

    manager.shutdown();
}

#[tokio::test]
async fn test_lost_plugin_yields_service_unavailable() {
    let (plugin_address, plugin) =
        start_plugin(|request: WireRequest| Ok(form_rewrite(request))).await;

    let channel = TcpChannel::open(&plugin_address);
    let deadline = Instant::now() + Duration::from_secs(5);
    assert_eq!(wait_ready(channel.as_ref(), deadline).await, ReadyOutcome::Ready);

    let connection: Arc<dyn PluginConnection> = channel.clone();
    let middleware: Arc<dyn Middleware> = Arc::new(RemotePluginMiddleware::from_connection(
        PluginDeclaration::new(
            "web",
            plugin_address.as_str(),
            PluginKind::RemoteProcedure,
            PluginOrder::Before,
        ),
        connection,
        Arc::new(HttpForwarderFactory::new()),
    ));

    plugin.cancel();
    timeout_at(deadline, channel.wait_for_state_change(ConnectivityState::Ready))
        .await
        .unwrap();
    assert_ne!(channel.state(), ConnectivityState::Ready);

    let echo = Arc::new(Echo::default());
    let chain = MiddlewareChain::new(vec![middleware.clone()], echo.clone());
    let mut req = ProxyRequest::new(http::Method::GET, "/".parse().unwrap());
    let mut rw = remote_plugin_proxy::http::BufferedResponse::new();
    chain.serve(&mut req, &mut rw).await;

    assert_eq!(rw.effective_status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(rw.body(), b"Service Unavailable");
    assert_eq!(echo.hits(), 0);

    middleware.stop();
    assert_eq!(channel.state(), ConnectivityState::Shutdown);
}

#[tokio::test]
async fn test_unreachable_plugin_is_not_registered() {
    let echo = Arc::new(Echo::default());
    let backend = start_backend(echo.clone()).await;

    let unused = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };

    let manager = Arc::new(PluginManager::new());
    let failures = manager
        .load_all(vec![
            PluginDeclaration::new("web", unused, PluginKind::RemoteProcedure, PluginOrder::Before)
                .with_timeout(1),
            PluginDeclaration::new(
                "web",
                "plugin.so",
                PluginKind::from("wasm"),
                PluginOrder::Before,
            ),
        ])
        .await;

    assert_eq!(failures.len(), 2);
    assert!(matches!(failures[0], PluginError::LoadFailed { .. }));
    assert!(matches!(failures[1], PluginError::UnknownKind { .. }));
    assert_eq!(manager.plugin_count(), 0);

    // Requests still reach the upstream without any plugin
    let front = start_front(backend.address, Some(manager.clone())).await;
    let response = reqwest::get(format!("http://{}/ok", front.address))
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "GET /ok\n");
    assert_eq!(echo.hits(), 1);
}

#[tokio::test]
async fn test_shutdown_skips_stopped_plugins_and_is_idempotent() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let (plugin_address, _plugin) = start_plugin(move |request: WireRequest| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(WireResponse::pass_through(request))
    })
    .await;

    let manager = load_plugin(&plugin_address, PluginOrder::Around).await;
    let middlewares = manager.middlewares_for("web");
    assert_eq!(middlewares.len(), 1);

    manager.shutdown();
    manager.shutdown();
    assert_eq!(manager.plugin_count(), 0);
    assert!(manager.middlewares_for("web").is_empty());

    // A middleware captured before shutdown no longer calls its plugin
    let echo = Arc::new(Echo::default());
    let chain = MiddlewareChain::new(middlewares.clone(), echo.clone());
    let mut req = ProxyRequest::new(http::Method::GET, "/".parse().unwrap());
    let mut rw = remote_plugin_proxy::http::BufferedResponse::new();
    chain.serve(&mut req, &mut rw).await;

    assert_eq!(echo.hits(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    middlewares[0].stop();
}

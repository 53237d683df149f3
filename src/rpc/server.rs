//! Plugin-side server for the line-delimited JSON protocol
//!
//! Plugin processes implement `RemoteMiddleware` and hand it to `serve`.
//! Each call runs on its own task, so one slow call does not hold up other
//! calls arriving on the same connection.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{self, RpcCall, RpcReply, SERVE_HTTP};
use crate::plugin::schema::{WireRequest, WireResponse};

const OUTBOUND_QUEUE: usize = 256;

/// Failure reported by a plugin implementation; sent back to the proxy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct RemoteError(pub String);

/// The operation a remote plugin exposes
#[async_trait]
pub trait RemoteMiddleware: Send + Sync + 'static {
    async fn serve_http(&self, request: WireRequest) -> Result<WireResponse, RemoteError>;
}

/// Adapts a synchronous closure into a `RemoteMiddleware`
pub struct PluginFn<F>(pub F);

#[async_trait]
impl<F> RemoteMiddleware for PluginFn<F>
where
    F: Fn(WireRequest) -> Result<WireResponse, RemoteError> + Send + Sync + 'static,
{
    async fn serve_http(&self, request: WireRequest) -> Result<WireResponse, RemoteError> {
        (self.0)(request)
    }
}

/// Accept proxy connections on `listener` until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    plugin: Arc<dyn RemoteMiddleware>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let local = listener.local_addr()?;
    info!(address = %local, "Plugin server listening");

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Failed to accept proxy connection");
                    continue;
                }
            },
        };

        let plugin = plugin.clone();
        let shutdown = shutdown.child_token();
        tokio::spawn(async move {
            debug!(%peer, "Proxy connected");
            handle_connection(stream, plugin, shutdown).await;
            debug!(%peer, "Proxy disconnected");
        });
    }

    info!(address = %local, "Plugin server stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    plugin: Arc<dyn RemoteMiddleware>,
    shutdown: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, codec::line_codec());
    let mut writer = FramedWrite::new(write_half, codec::line_codec());
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

    // FramedRead ends the stream once after a decode error, then resumes
    let mut resuming = false;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(frame) = rx.recv() => {
                if let Err(e) = writer.send(frame).await {
                    warn!(error = %e, "Failed to write reply");
                    break;
                }
            }
            line = reader.next() => match line {
                Some(Ok(line)) => {
                    resuming = false;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let plugin = plugin.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let reply = answer(plugin.as_ref(), &line).await;
                        let frame = codec::encode(&reply).or_else(|e| {
                            warn!(id = reply.id, error = %e, "Failed to encode reply");
                            codec::encode(&RpcReply::err(reply.id, e.to_string()))
                        });
                        if let Ok(frame) = frame {
                            let _ = tx.send(frame).await;
                        }
                    });
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    resuming = true;
                    warn!(max = codec::MAX_FRAME_LENGTH, "Discarding oversized call");
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Failed to read call");
                    break;
                }
                None if resuming => resuming = false,
                None => break,
            },
        }
    }
}

async fn answer(plugin: &dyn RemoteMiddleware, line: &str) -> RpcReply {
    let call: RpcCall = match codec::decode(line) {
        Ok(call) => call,
        Err(e) => {
            warn!(error = %e, "Received undecodable call");
            return RpcReply::err(0, e.to_string());
        }
    };

    if call.method != SERVE_HTTP {
        return RpcReply::err(call.id, format!("unknown method '{}'", call.method));
    }

    debug!(id = call.id, request_id = %call.params.request_id, "Serving plugin call");
    match plugin.serve_http(call.params).await {
        Ok(response) => RpcReply::ok(call.id, response),
        Err(e) => RpcReply::err(call.id, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{wait_ready, PluginConnection, ReadyOutcome, TcpChannel, TransportError};
    use std::time::Duration;
    use tokio::time::Instant;

    async fn start(plugin: Arc<dyn RemoteMiddleware>) -> (String, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, plugin, shutdown.clone()));
        (address, shutdown)
    }

    async fn ready_channel(address: &str) -> Arc<TcpChannel> {
        let channel = TcpChannel::open(address);
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(wait_ready(channel.as_ref(), deadline).await, ReadyOutcome::Ready);
        channel
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let plugin = Arc::new(PluginFn(
            |mut request: WireRequest| -> Result<WireResponse, RemoteError> {
                request.method = "PUT".to_string();
                Ok(WireResponse::pass_through(request))
            },
        ));
        let (address, shutdown) = start(plugin).await;
        let channel = ready_channel(&address).await;

        let response = channel
            .serve_http(WireRequest {
                request_id: "req-1".to_string(),
                method: "GET".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(response.request.request_id, "req-1");
        assert_eq!(response.request.method, "PUT");
        assert_eq!(channel.pending_calls(), 0);

        channel.close();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_plugin_error_is_reported() {
        let plugin = Arc::new(PluginFn(
            |_request: WireRequest| -> Result<WireResponse, RemoteError> {
                Err(RemoteError("denied".to_string()))
            },
        ));
        let (address, shutdown) = start(plugin).await;
        let channel = ready_channel(&address).await;

        let result = channel.serve_http(WireRequest::default()).await;
        assert_eq!(result, Err(TransportError::Remote("denied".to_string())));

        channel.close();
        shutdown.cancel();
    }

    struct SlowFirst;

    #[async_trait]
    impl RemoteMiddleware for SlowFirst {
        async fn serve_http(&self, request: WireRequest) -> Result<WireResponse, RemoteError> {
            if request.request_id == "slow" {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(WireResponse::pass_through(request))
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_complete_independently() {
        let (address, shutdown) = start(Arc::new(SlowFirst)).await;
        let channel = ready_channel(&address).await;

        let slow = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .serve_http(WireRequest {
                        request_id: "slow".to_string(),
                        ..Default::default()
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        let fast = channel
            .serve_http(WireRequest {
                request_id: "fast".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(fast.request.request_id, "fast");
        assert!(started.elapsed() < Duration::from_millis(150));

        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow.request.request_id, "slow");

        channel.close();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_oversized_call_fails_alone() {
        let (address, shutdown) = start(Arc::new(SlowFirst)).await;
        let channel = ready_channel(&address).await;

        let slow = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .serve_http(WireRequest {
                        request_id: "slow".to_string(),
                        ..Default::default()
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let oversized = channel
            .serve_http(WireRequest {
                request_id: "big".to_string(),
                body: bytes::Bytes::from(vec![b'x'; codec::MAX_FRAME_LENGTH]),
                ..Default::default()
            })
            .await;
        assert!(matches!(oversized, Err(TransportError::Encode(_))));

        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow.request.request_id, "slow");
        assert_eq!(channel.state(), crate::rpc::ConnectivityState::Ready);

        channel.close();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_connection_survives_oversized_line() {
        use tokio::io::AsyncWriteExt;

        let (address, shutdown) = start(Arc::new(SlowFirst)).await;
        let stream = TcpStream::connect(&address).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();

        let mut garbage = vec![b'x'; codec::MAX_FRAME_LENGTH + 1];
        garbage.push(b'\n');
        write_half.write_all(&garbage).await.unwrap();

        let call = codec::encode(&RpcCall {
            id: 9,
            method: SERVE_HTTP.to_string(),
            params: WireRequest {
                request_id: "after-garbage".to_string(),
                ..Default::default()
            },
        })
        .unwrap();
        write_half.write_all(format!("{call}\n").as_bytes()).await.unwrap();

        let mut reader = FramedRead::new(read_half, codec::line_codec());
        let line = tokio::time::timeout(Duration::from_secs(5), reader.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let reply: RpcReply = codec::decode(&line).unwrap();
        assert_eq!(reply.id, 9);
        assert_eq!(reply.into_result().unwrap().request.request_id, "after-garbage");

        shutdown.cancel();
    }
}

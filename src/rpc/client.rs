//! TCP client for remote plugins
//!
//! A `TcpChannel` owns a background task that keeps one TCP connection to
//! the plugin alive: it connects, publishes `Ready`, forwards outgoing
//! frames and routes replies to their callers, and on failure backs off and
//! reconnects until the channel is closed.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{self, RpcCall, RpcReply, SERVE_HTTP};
use super::{ConnectivityState, Dialer, PluginConnection, TransportError};
use crate::plugin::schema::{WireRequest, WireResponse};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const OUTBOUND_QUEUE: usize = 256;

type PendingReply = oneshot::Sender<Result<WireResponse, TransportError>>;

/// Dials plugins listening on `host:port`
#[derive(Debug, Clone, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str) -> Result<Arc<dyn PluginConnection>, TransportError> {
        validate_address(address)?;
        Ok(TcpChannel::open(address))
    }
}

fn validate_address(address: &str) -> Result<(), TransportError> {
    let invalid = |reason: &str| TransportError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
    Ok(())
}

/// Reconnecting, multiplexed connection to one plugin
pub struct TcpChannel {
    shared: Arc<Shared>,
}

struct Shared {
    address: String,
    state: watch::Sender<ConnectivityState>,
    /// Sender into the live connection's write loop, if connected
    outbound: ArcSwapOption<mpsc::Sender<String>>,
    pending: DashMap<u64, PendingReply>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl TcpChannel {
    /// Start connecting to `address` in the background
    pub fn open(address: &str) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectivityState::Idle);
        let shared = Arc::new(Shared {
            address: address.to_string(),
            state,
            outbound: ArcSwapOption::empty(),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run(shared.clone()));

        Arc::new(Self { shared })
    }

    /// Number of calls waiting for a reply
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

#[async_trait]
impl PluginConnection for TcpChannel {
    fn state(&self) -> ConnectivityState {
        *self.shared.state.borrow()
    }

    async fn wait_for_state_change(&self, current: ConnectivityState) -> bool {
        let mut rx = self.shared.state.subscribe();
        loop {
            if *rx.borrow_and_update() != current {
                return true;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    async fn serve_http(&self, request: WireRequest) -> Result<WireResponse, TransportError> {
        let state = self.state();
        if state != ConnectivityState::Ready {
            return Err(TransportError::Unavailable { state });
        }
        let sender = self
            .shared
            .outbound
            .load_full()
            .ok_or(TransportError::Unavailable { state })?;

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = codec::encode(&RpcCall {
            id,
            method: SERVE_HTTP.to_string(),
            params: request,
        })?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.shared.pending,
            id,
        };

        if sender.send(frame).await.is_err() {
            return Err(TransportError::ConnectionLost);
        }

        rx.await.unwrap_or(Err(TransportError::ConnectionLost))
    }

    fn close(&self) {
        self.shared.shutdown.cancel();
        self.shared.enter_shutdown();
    }
}

/// Drops the pending entry if the caller goes away before the reply
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, PendingReply>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl Shared {
    /// Move to `next` unless the channel already shut down
    fn set_state(&self, next: ConnectivityState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ConnectivityState::Shutdown || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!(address = %self.address, state = %next, "Plugin connection state changed");
        }
    }

    fn enter_shutdown(&self) {
        self.outbound.store(None);
        let previous = self.state.send_replace(ConnectivityState::Shutdown);
        if previous != ConnectivityState::Shutdown {
            debug!(address = %self.address, "Plugin connection shut down");
        }
        self.fail_pending(TransportError::Closed);
    }

    fn fail_pending(&self, error: TransportError) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, waiter)) = self.pending.remove(&id) {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    fn dispatch(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        let reply: RpcReply = match codec::decode(line) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    address = %self.address,
                    error = %e,
                    "Discarding undecodable reply from plugin"
                );
                return;
            }
        };

        match self.pending.remove(&reply.id) {
            Some((_, waiter)) => {
                let _ = waiter.send(reply.into_result());
            }
            None => debug!(address = %self.address, id = reply.id, "Reply for unknown call"),
        }
    }

    /// Pump frames over one established connection until it fails or the
    /// channel shuts down
    async fn serve(&self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, codec::line_codec());
        let mut writer = FramedWrite::new(write_half, codec::line_codec());

        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        self.outbound.store(Some(Arc::new(tx)));
        self.set_state(ConnectivityState::Ready);

        // FramedRead ends the stream once after a decode error, then resumes
        let mut resuming = false;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(frame) = rx.recv() => {
                    if let Err(e) = writer.send(frame).await {
                        warn!(address = %self.address, error = %e, "Failed to write to plugin");
                        break;
                    }
                }
                line = reader.next() => match line {
                    Some(Ok(line)) => {
                        resuming = false;
                        self.dispatch(&line);
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        resuming = true;
                        warn!(
                            address = %self.address,
                            max = codec::MAX_FRAME_LENGTH,
                            "Discarding oversized reply from plugin"
                        );
                    }
                    Some(Err(e)) => {
                        warn!(address = %self.address, error = %e, "Failed to read from plugin");
                        break;
                    }
                    None if resuming => resuming = false,
                    None => {
                        debug!(address = %self.address, "Plugin closed the connection");
                        break;
                    }
                },
            }
        }

        self.outbound.store(None);
    }
}

async fn run(shared: Arc<Shared>) {
    let mut backoff = INITIAL_BACKOFF;

    while !shared.shutdown.is_cancelled() {
        shared.set_state(ConnectivityState::Connecting);

        let connected = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            result = TcpStream::connect(shared.address.as_str()) => result,
        };

        match connected {
            Ok(stream) => {
                backoff = INITIAL_BACKOFF;
                info!(address = %shared.address, "Plugin connection established");
                shared.serve(stream).await;
                shared.fail_pending(TransportError::ConnectionLost);
                if shared.shutdown.is_cancelled() {
                    break;
                }
                warn!(address = %shared.address, "Plugin connection lost, reconnecting");
            }
            Err(e) => {
                debug!(address = %shared.address, error = %e, "Failed to connect to plugin");
            }
        }

        shared.set_state(ConnectivityState::TransientFailure);

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    shared.enter_shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{wait_ready, ReadyOutcome};
    use tokio::net::TcpListener;
    use tokio::time::Instant;

    async fn unused_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        address
    }

    #[test]
    fn test_address_validation() {
        assert!(validate_address("localhost:22803").is_ok());
        assert!(validate_address("[::1]:8080").is_ok());
        assert!(validate_address("no-port").is_err());
        assert!(validate_address(":80").is_err());
        assert!(validate_address("host:http").is_err());
    }

    #[tokio::test]
    async fn test_dial_rejects_invalid_address() {
        let result = TcpDialer.dial("not an address").await;
        assert!(matches!(result, Err(TransportError::InvalidAddress { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_plugin_never_becomes_ready() {
        let address = unused_address().await;
        let conn = TcpDialer.dial(&address).await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(300);
        assert_eq!(wait_ready(conn.as_ref(), deadline).await, ReadyOutcome::TimedOut);
        assert_ne!(conn.state(), ConnectivityState::Ready);

        conn.close();
    }

    #[tokio::test]
    async fn test_becomes_ready_when_listener_exists() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.map(|(s, _)| s) });

        let conn = TcpDialer.dial(&address).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(wait_ready(conn.as_ref(), deadline).await, ReadyOutcome::Ready);

        let _server_side = accept.await.unwrap().unwrap();
        conn.close();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let address = unused_address().await;
        let conn = TcpDialer.dial(&address).await.unwrap();

        conn.close();
        conn.close();

        assert_eq!(conn.state(), ConnectivityState::Shutdown);
        let result = conn.serve_http(WireRequest::default()).await;
        assert_eq!(
            result,
            Err(TransportError::Unavailable {
                state: ConnectivityState::Shutdown
            })
        );
    }
}

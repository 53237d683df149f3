//! RPC transport between the proxy and remote plugin processes
//!
//! The adapter only depends on the `Dialer` and `PluginConnection` traits:
//! a dialer hands back a connection immediately, and the connection reports
//! its connectivity state as it comes up, fails, reconnects or shuts down.
//! `wait_ready` turns those state changes into a deadline-bounded wait.
//!
//! The bundled implementation (`client`, `server`) exchanges one JSON
//! object per line over TCP and multiplexes concurrent calls by id.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};

use crate::plugin::schema::{WireRequest, WireResponse};

pub mod client;
pub mod codec;
pub mod server;

pub use client::{TcpChannel, TcpDialer};
pub use server::{serve, PluginFn, RemoteError, RemoteMiddleware};

/// Connectivity state of a plugin connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    /// Terminal: the connection was closed and will not come back
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::TransientFailure => "transient_failure",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Invalid plugin address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Connection unavailable (state: {state})")]
    Unavailable { state: ConnectivityState },

    #[error("Connection lost before a reply was received")]
    ConnectionLost,

    #[error("Transport closed")]
    Closed,

    #[error("Failed to encode call: {0}")]
    Encode(String),

    #[error("Failed to decode reply: {0}")]
    Decode(String),

    #[error("Remote plugin error: {0}")]
    Remote(String),
}

/// Client side of one plugin connection
#[async_trait]
pub trait PluginConnection: Send + Sync + 'static {
    fn state(&self) -> ConnectivityState;

    /// Wait until the state differs from `current`.
    ///
    /// Returns `false` if the state can no longer change.
    async fn wait_for_state_change(&self, current: ConnectivityState) -> bool;

    /// Invoke the plugin's `ServeHTTP` operation
    async fn serve_http(&self, request: WireRequest) -> Result<WireResponse, TransportError>;

    /// Close the connection. Safe to call more than once.
    fn close(&self);
}

/// Creates plugin connections from an address
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Start connecting to `address`. The returned connection may not be
    /// ready yet; see `wait_ready`.
    async fn dial(&self, address: &str) -> Result<Arc<dyn PluginConnection>, TransportError>;
}

/// Outcome of waiting for a connection to become ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyOutcome {
    Ready,
    TimedOut,
    Canceled,
}

/// Wait for `conn` to reach `Ready`, giving up at `deadline`.
///
/// Wakes only on state changes or on the deadline. A connection that shuts
/// down (or whose state can no longer change) counts as canceled.
pub async fn wait_ready(conn: &dyn PluginConnection, deadline: Instant) -> ReadyOutcome {
    loop {
        let state = conn.state();
        match state {
            ConnectivityState::Ready => return ReadyOutcome::Ready,
            ConnectivityState::Shutdown => return ReadyOutcome::Canceled,
            _ => {}
        }

        match timeout_at(deadline, conn.wait_for_state_change(state)).await {
            Ok(true) => continue,
            Ok(false) => return ReadyOutcome::Canceled,
            Err(_) => return ReadyOutcome::TimedOut,
        }
    }
}

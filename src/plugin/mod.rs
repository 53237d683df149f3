//! Remote plugin middleware
//!
//! Plugins extend an entry point's handler chain. Each configured plugin is
//! loaded once at startup into a [`Middleware`] and registered under its
//! entry point; the routing layer asks the [`PluginManager`] for an entry's
//! middlewares and runs them in load order in front of its own handler.
//!
//! # Architecture
//!
//! - **Remote plugins**: run in their own process and are reached over the
//!   RPC transport in [`crate::rpc`]. The adapter snapshots the live request
//!   into a [`schema::WireRequest`], calls the plugin before and/or after the
//!   next handler, and applies the plugin's reply (rewrite the request,
//!   redirect, render a response, or stop the chain).
//! - **Native plugins**: produced by an external [`NativeLoader`]; the
//!   manager only checks that the produced instance is a middleware.
//! - **Fault isolation**: instantiation runs on its own task, so a panicking
//!   plugin constructor becomes a load error instead of taking the host down.
//!
//! # Modules
//!
//! - `declaration`: plugin declarations (kind, order, timeout)
//! - `schema`: wire envelopes and header/query conversions
//! - `middleware`: the `Middleware` and `Handler` capabilities
//! - `bridge`: live request to wire request, and back
//! - `remote`: the remote plugin adapter
//! - `forward`: reverse-proxy forwarding used for plugin redirects
//! - `chain`: runs an entry's middlewares in front of a terminal handler
//! - `manager`: plugin registry and lifecycle

use thiserror::Error;

pub mod bridge;
pub mod chain;
pub mod declaration;
pub mod forward;
pub mod manager;
pub mod middleware;
pub mod remote;
pub mod schema;

pub use chain::MiddlewareChain;
pub use declaration::{PluginDeclaration, PluginKind, PluginOrder};
pub use forward::{Forwarder, ForwarderFactory, HttpForwarder, HttpForwarderFactory};
pub use manager::{NativeLoader, PluginManager, Registry};
pub use middleware::{Handler, HandlerFn, Middleware};
pub use remote::RemotePluginMiddleware;
pub use schema::{WireHttpResponse, WireRequest, WireResponse};

/// Plugin load-time errors
#[derive(Error, Debug)]
pub enum PluginError {
    /// Declaration names a plugin kind this build cannot load
    #[error("Unknown plugin type '{kind}'")]
    UnknownKind { kind: String },

    /// Remote plugin declared without an address
    #[error("Can't load remote plugin for entry '{entry}' without an address")]
    MissingAddress { entry: String },

    /// Instantiation succeeded but produced no instance
    #[error("Plugin '{path}' produced no instance")]
    NotLoaded { path: String },

    /// Produced instance does not implement the middleware capability
    #[error("Plugin '{path}' does not implement the middleware interface")]
    NotMiddleware { path: String },

    #[error("No native plugin loader configured, can't load '{path}'")]
    NativeLoaderUnavailable { path: String },

    #[error("Failed to load native plugin '{path}': {reason}")]
    NativeLoad { path: String, reason: String },

    /// Dial failure or the connection never became ready
    #[error("Plugin load failed for '{path}': {reason}")]
    LoadFailed { path: String, reason: String },

    /// Instantiation task panicked
    #[error("Plugin instantiation panicked: {reason}")]
    Panicked { reason: String },

    #[error("Forwarder unavailable: {reason}")]
    ForwarderUnavailable { reason: String },
}

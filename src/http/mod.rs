//! Live HTTP objects that flow through the middleware chain
//!
//! `ProxyRequest` is the proxy's mutable view of an in-flight request and
//! `ResponseWriter` is the sink handlers write the response into. Plugins
//! operate on snapshots of these (see `plugin::schema`), and the remote
//! adapter copies their edits back onto the live objects.

pub mod request;
pub mod response;

pub use request::{BoxError, ProxyRequest, RequestBody};
pub use response::{BufferedResponse, ResponseWriter};

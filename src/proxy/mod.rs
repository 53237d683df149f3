//! Entry-point HTTP servers
//!
//! Each configured entry point listens on its own address. A request runs
//! through the entry's plugin middlewares and, if the chain lets it through,
//! is forwarded to the entry's upstream.

pub mod entry_point;
pub mod upstream;

pub use entry_point::EntryPoint;
pub use upstream::UpstreamHandler;

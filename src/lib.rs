pub mod commands;
pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod plugin;
pub mod proxy;
pub mod rpc;

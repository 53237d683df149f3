use std::io;
use thiserror::Error;

pub use crate::plugin::PluginError;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to bind entry point '{entry}' on {address}: {source}")]
    Bind {
        entry: String,
        address: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

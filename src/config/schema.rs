use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::plugin::PluginDeclaration;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Plugins in load order
    #[serde(default)]
    pub plugins: Vec<PluginDeclaration>,

    #[serde(default, alias = "entry_points")]
    pub entry_points: HashMap<String, EntryPointConfig>,

    /// How long to wait for in-flight requests when shutting down
    #[serde(default = "default_shutdown_timeout", alias = "shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

/// One listening entry point and the upstream it proxies to
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPointConfig {
    /// Listen address, `host:port`
    pub address: String,

    /// Base URL requests are forwarded to once the plugin chain lets them through
    pub upstream: String,

    #[serde(default = "default_forward_timeout", alias = "forward_timeout_secs")]
    pub forward_timeout_secs: u64,
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_forward_timeout() -> u64 {
    30
}

impl Config {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Entry point names in a stable order
    pub fn entry_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entry_points.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl EntryPointConfig {
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs)
    }
}

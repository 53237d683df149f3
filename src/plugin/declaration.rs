//! Plugin declarations
//!
//! A declaration says which entry point a plugin attaches to, how to reach
//! it, and whether it runs before, after or around the rest of the chain.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How a plugin is instantiated
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PluginKind {
    /// Natively compiled plugin loaded from a file
    Native,
    /// Out-of-process plugin reached over RPC
    RemoteProcedure,
    /// Kind string this build does not know; rejected at load time
    Unknown(String),
}

impl From<String> for PluginKind {
    fn from(kind: String) -> Self {
        match kind.to_ascii_lowercase().as_str() {
            "native" | "go" => Self::Native,
            "rpc" | "grpc" | "remote" => Self::RemoteProcedure,
            _ => Self::Unknown(kind),
        }
    }
}

impl From<&str> for PluginKind {
    fn from(kind: &str) -> Self {
        Self::from(kind.to_string())
    }
}

impl From<PluginKind> for String {
    fn from(kind: PluginKind) -> Self {
        match kind {
            PluginKind::Native => "native".to_string(),
            PluginKind::RemoteProcedure => "rpc".to_string(),
            PluginKind::Unknown(kind) => kind,
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => f.write_str("native"),
            Self::RemoteProcedure => f.write_str("rpc"),
            Self::Unknown(kind) => f.write_str(kind),
        }
    }
}

/// Where a plugin runs relative to the next handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginOrder {
    Before,
    After,
    Around,
}

impl fmt::Display for PluginOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order = match self {
            Self::Before => "before",
            Self::After => "after",
            Self::Around => "around",
        };
        f.write_str(order)
    }
}

/// One configured plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDeclaration {
    /// Entry point the plugin attaches to
    pub entry_name: String,

    /// File path of a native plugin, or `host:port` of a remote plugin
    #[serde(default)]
    pub path: String,

    #[serde(rename = "type", alias = "kind")]
    pub kind: PluginKind,

    pub order: PluginOrder,

    /// Bound for connecting to the plugin and waiting for readiness
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    10
}

impl PluginDeclaration {
    pub fn new(
        entry_name: impl Into<String>,
        path: impl Into<String>,
        kind: PluginKind,
        order: PluginOrder,
    ) -> Self {
        Self {
            entry_name: entry_name.into(),
            path: path.into(),
            kind,
            order,
            timeout_seconds: default_timeout_seconds(),
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// True when the plugin is called before the next handler (`before` or `around`)
    pub fn runs_before(&self) -> bool {
        matches!(self.order, PluginOrder::Before | PluginOrder::Around)
    }

    /// True when the plugin is called after the next handler (`after` or `around`)
    pub fn runs_after(&self) -> bool {
        matches!(self.order, PluginOrder::After | PluginOrder::Around)
    }

    pub fn is_around(&self) -> bool {
        self.order == PluginOrder::Around
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

//! Plugin registry and lifecycle management
//!
//! The manager turns declarations into middlewares, keeps them per entry
//! point in load order, and stops them on shutdown. The registry is written
//! only while plugins load and read concurrently afterwards.

use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::http::BoxError;
use crate::plugin::declaration::{PluginDeclaration, PluginKind};
use crate::plugin::forward::{ForwarderFactory, HttpForwarderFactory};
use crate::plugin::middleware::Middleware;
use crate::plugin::remote::RemotePluginMiddleware;
use crate::plugin::PluginError;
use crate::rpc::{Dialer, TcpDialer};

/// Loads natively compiled plugins.
///
/// The returned instance is opaque; the manager accepts it only if it is an
/// `Arc<dyn Middleware>`.
pub trait NativeLoader: Send + Sync + 'static {
    /// Load the plugin at `path`. `Ok(None)` means the file yielded no instance.
    fn load(&self, path: &str) -> Result<Option<Box<dyn Any + Send>>, BoxError>;
}

/// Upper bound for forwarding a request a plugin redirected
const REDIRECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Manages plugin loading, lookup and shutdown
pub struct PluginManager {
    /// Middlewares per entry point, in load order
    registry: DashMap<String, Vec<Arc<dyn Middleware>>>,
    dialer: Arc<dyn Dialer>,
    native_loader: Option<Arc<dyn NativeLoader>>,
    forwarders: Arc<dyn ForwarderFactory>,
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginManager {
    /// Manager that dials remote plugins over TCP and has no native loader
    pub fn new() -> Self {
        Self {
            registry: DashMap::new(),
            dialer: Arc::new(TcpDialer),
            native_loader: None,
            forwarders: Arc::new(HttpForwarderFactory::with_timeout(REDIRECT_TIMEOUT)),
        }
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn with_native_loader(mut self, loader: Arc<dyn NativeLoader>) -> Self {
        self.native_loader = Some(loader);
        self
    }

    pub fn with_forwarder_factory(mut self, forwarders: Arc<dyn ForwarderFactory>) -> Self {
        self.forwarders = forwarders;
        self
    }

    /// Instantiate one plugin and register it under its entry point.
    ///
    /// Instantiation runs on its own task; a panic there is reported as
    /// `PluginError::Panicked` and leaves the registry unchanged.
    pub async fn load(&self, declaration: PluginDeclaration) -> Result<(), PluginError> {
        let entry = declaration.entry_name.clone();
        let path = declaration.path.clone();
        let kind = declaration.kind.clone();

        debug!(plugin = %entry, path = %path, kind = %kind, "Loading plugin");

        let (tx, rx) = oneshot::channel();
        let dialer = self.dialer.clone();
        let native_loader = self.native_loader.clone();
        let forwarders = self.forwarders.clone();

        let task = tokio::spawn(async move {
            let result = instantiate(declaration, dialer, native_loader, forwarders).await;
            let _ = tx.send(result);
        });

        let middleware = match rx.await {
            Ok(result) => result?,
            Err(_) => {
                let reason = match task.await {
                    Err(e) if e.is_panic() => panic_message(e.into_panic()),
                    Err(e) => e.to_string(),
                    Ok(()) => "load task ended without a result".to_string(),
                };
                error!(
                    plugin = %entry,
                    path = %path,
                    reason = %reason,
                    "Plugin instantiation panicked"
                );
                return Err(PluginError::Panicked { reason });
            }
        };

        self.registry.entry(entry.clone()).or_default().push(middleware);

        info!(plugin = %entry, path = %path, kind = %kind, "Plugin loaded");
        Ok(())
    }

    /// Load every declaration in order. Failures are logged and returned;
    /// they do not stop the remaining declarations from loading.
    pub async fn load_all<I>(&self, declarations: I) -> Vec<PluginError>
    where
        I: IntoIterator<Item = PluginDeclaration>,
    {
        let mut failures = Vec::new();

        for declaration in declarations {
            let entry = declaration.entry_name.clone();
            let path = declaration.path.clone();
            if let Err(e) = self.load(declaration).await {
                error!(plugin = %entry, path = %path, error = %e, "Failed to load plugin");
                failures.push(e);
            }
        }

        info!(
            plugins = self.plugin_count(),
            entries = self.entry_count(),
            failed = failures.len(),
            "Plugins loaded"
        );
        failures
    }

    /// Middlewares registered for `entry_name`, in load order
    pub fn middlewares_for(&self, entry_name: &str) -> Vec<Arc<dyn Middleware>> {
        self.registry
            .get(entry_name)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    /// Stop every registered middleware, removing entry points one at a time
    pub fn shutdown(&self) {
        let entries: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();

        for name in entries {
            if let Some((name, middlewares)) = self.registry.remove(&name) {
                debug!(entry = %name, plugins = middlewares.len(), "Stopping plugins");
                for middleware in middlewares {
                    middleware.stop();
                }
            }
        }
    }

    pub fn plugin_count(&self) -> usize {
        self.registry.iter().map(|e| e.value().len()).sum()
    }

    pub fn entry_count(&self) -> usize {
        self.registry.len()
    }
}

/// Registry lookups that also work on an absent manager
pub trait Registry {
    fn middlewares_for(&self, entry_name: &str) -> Vec<Arc<dyn Middleware>>;

    fn shutdown(&self);
}

impl Registry for PluginManager {
    fn middlewares_for(&self, entry_name: &str) -> Vec<Arc<dyn Middleware>> {
        PluginManager::middlewares_for(self, entry_name)
    }

    fn shutdown(&self) {
        PluginManager::shutdown(self)
    }
}

impl<R: Registry + ?Sized> Registry for Arc<R> {
    fn middlewares_for(&self, entry_name: &str) -> Vec<Arc<dyn Middleware>> {
        (**self).middlewares_for(entry_name)
    }

    fn shutdown(&self) {
        (**self).shutdown()
    }
}

impl<R: Registry> Registry for Option<R> {
    fn middlewares_for(&self, entry_name: &str) -> Vec<Arc<dyn Middleware>> {
        match self {
            Some(registry) => registry.middlewares_for(entry_name),
            None => Vec::new(),
        }
    }

    fn shutdown(&self) {
        if let Some(registry) = self {
            registry.shutdown();
        }
    }
}

async fn instantiate(
    declaration: PluginDeclaration,
    dialer: Arc<dyn Dialer>,
    native_loader: Option<Arc<dyn NativeLoader>>,
    forwarders: Arc<dyn ForwarderFactory>,
) -> Result<Arc<dyn Middleware>, PluginError> {
    match declaration.kind.clone() {
        PluginKind::RemoteProcedure => {
            let middleware =
                RemotePluginMiddleware::connect(declaration, dialer.as_ref(), forwarders).await?;
            Ok(Arc::new(middleware))
        }
        PluginKind::Native => {
            let path = declaration.path;
            let loader = native_loader.ok_or_else(|| PluginError::NativeLoaderUnavailable {
                path: path.clone(),
            })?;
            let instance = loader
                .load(&path)
                .map_err(|e| PluginError::NativeLoad {
                    path: path.clone(),
                    reason: e.to_string(),
                })?
                .ok_or_else(|| PluginError::NotLoaded { path: path.clone() })?;
            as_middleware(instance, &path)
        }
        PluginKind::Unknown(kind) => Err(PluginError::UnknownKind { kind }),
    }
}

fn as_middleware(
    instance: Box<dyn Any + Send>,
    path: &str,
) -> Result<Arc<dyn Middleware>, PluginError> {
    instance
        .downcast::<Arc<dyn Middleware>>()
        .map(|middleware| *middleware)
        .map_err(|_| PluginError::NotMiddleware {
            path: path.to_string(),
        })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

use crate::config::Config;
use crate::error::{ConfigError, ProxyError, Result};
use crate::plugin::{PluginKind, PluginManager};
use tracing::{error, info, warn};

/// Validate the configuration and list what it declares. With `connect`,
/// also load every plugin once to verify it is reachable.
pub async fn run_config_check(config: Config, connect: bool) -> Result<()> {
    info!("Checking configuration...");

    crate::config::validate(&config)?;
    info!("✓ Configuration is valid");

    info!("Checking {} entry point(s)...", config.entry_points.len());
    for name in config.entry_names() {
        let entry = &config.entry_points[name];
        info!("  {}: {} -> {}", name, entry.address, entry.upstream);
    }

    info!("Checking {} plugin(s)...", config.plugins.len());
    let mut all_ok = true;

    for plugin in &config.plugins {
        info!(
            "\n  Plugin for '{}': {} ({}, order {}, timeout {}s)",
            plugin.entry_name, plugin.path, plugin.kind, plugin.order, plugin.timeout_seconds
        );

        if let PluginKind::Unknown(kind) = &plugin.kind {
            error!("  ✗ Unknown plugin type '{}'", kind);
            all_ok = false;
            continue;
        }

        if !connect {
            continue;
        }

        if plugin.kind != PluginKind::RemoteProcedure {
            warn!("  ! Connection test skipped (only supported for remote plugins)");
            continue;
        }

        let manager = PluginManager::new();
        match manager.load(plugin.clone()).await {
            Ok(()) => info!("  ✓ Plugin is reachable"),
            Err(e) => {
                error!("  ✗ {}", e);
                all_ok = false;
            }
        }
        manager.shutdown();
    }

    if all_ok {
        info!("\n✓ All checks passed");
        Ok(())
    } else {
        Err(ProxyError::Config(ConfigError::Validation(
            "One or more plugins failed checks".to_string(),
        )))
    }
}

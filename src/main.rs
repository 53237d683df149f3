use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use remote_plugin_proxy::commands;
use remote_plugin_proxy::config::{self, Config};
use remote_plugin_proxy::error::Result;
use remote_plugin_proxy::logging::{self, LogFormat};
use remote_plugin_proxy::plugin::{PluginManager, Registry};
use remote_plugin_proxy::proxy::EntryPoint;

#[derive(Parser, Debug)]
#[command(name = "remote-plugin-proxy")]
#[command(about = "Reverse proxy with out-of-process plugin middlewares", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the proxy (default)
    Run,
    /// Check configuration and list declared plugins
    Check {
        /// Connect to every remote plugin once
        #[arg(long)]
        connect: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init(args.debug, args.log_format);

    let config = match args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            match config::load_from_path(&path) {
                Ok(cfg) => {
                    info!("Configuration loaded successfully from {}", path.display());
                    cfg
                }
                Err(e) => {
                    error!(
                        "Failed to load configuration from {}: {}",
                        path.display(),
                        e
                    );
                    return Err(e);
                }
            }
        }
        None => {
            info!("Loading configuration from default locations");
            match config::load_from_env_or_file() {
                Ok(cfg) => {
                    info!("Configuration loaded successfully");
                    cfg
                }
                Err(e) => {
                    error!("Failed to load configuration: {}", e);
                    return Err(e);
                }
            }
        }
    };

    match args.command.unwrap_or(Command::Run) {
        Command::Check { connect } => commands::run_config_check(config, connect).await,
        Command::Run => run(config).await,
    }
}

async fn run(config: Config) -> Result<()> {
    info!("Starting remote plugin proxy");
    info!(
        "Loaded {} entry point(s) and {} plugin declaration(s)",
        config.entry_points.len(),
        config.plugins.len()
    );

    let plugins = if config.plugins.is_empty() {
        None
    } else {
        let manager = Arc::new(PluginManager::new());
        let failures = manager.load_all(config.plugins.clone()).await;
        if !failures.is_empty() {
            warn!("{} plugin(s) failed to load and will not serve traffic", failures.len());
        }
        Some(manager)
    };

    let shutdown = CancellationToken::new();
    let handles = match start_entry_points(&config, plugins.clone(), &shutdown).await {
        Ok(handles) => handles,
        Err(e) => {
            error!("Failed to start entry points: {}", e);
            shutdown.cancel();
            plugins.shutdown();
            return Err(e);
        }
    };

    if handles.is_empty() {
        warn!("No entry points configured, nothing to serve");
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down remote plugin proxy");
    shutdown.cancel();

    let graceful =
        tokio::time::timeout(config.shutdown_timeout(), futures::future::join_all(handles)).await;

    plugins.shutdown();

    match graceful {
        Ok(_) => {
            info!("Graceful shutdown completed");
        }
        Err(_) => {
            error!("Shutdown timeout exceeded, forcing exit");
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn start_entry_points(
    config: &Config,
    plugins: Option<Arc<PluginManager>>,
    shutdown: &CancellationToken,
) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::new();

    for name in config.entry_names() {
        let entry = Arc::new(EntryPoint::new(
            name,
            &config.entry_points[name],
            plugins.clone(),
        )?);
        let listener = entry.bind().await?;
        info!(
            "Entry point '{}' on {} ({} plugin(s))",
            name,
            entry.address(),
            plugins.middlewares_for(name).len()
        );

        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let name = entry.name().to_string();
            if let Err(e) = entry.serve(listener, token).await {
                error!("Entry point '{}' error: {}", name, e);
            }
        }));
    }

    Ok(handles)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}

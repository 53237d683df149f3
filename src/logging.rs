use tracing_subscriber::EnvFilter;

/// Output format of log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install the global subscriber.
///
/// `RUST_LOG` is honoured (default `info`); `debug` raises this crate's
/// level on top of it.
pub fn init(debug: bool, format: LogFormat) {
    let builder = tracing_subscriber::fmt().with_env_filter(filter(debug));

    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    if let Err(e) = result {
        eprintln!("Logging already initialized: {e}");
    }
}

fn filter(debug: bool) -> EnvFilter {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if !debug {
        return filter;
    }

    match "remote_plugin_proxy=debug".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

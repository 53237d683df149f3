//! Sample remote plugin: replaces every request body with the URL-encoded
//! form `data={"siid":"MIOffice-5G"}` and lets the chain continue.

use bytes::Bytes;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use remote_plugin_proxy::logging::{self, LogFormat};
use remote_plugin_proxy::plugin::{WireRequest, WireResponse};
use remote_plugin_proxy::rpc::{self, PluginFn, RemoteError};

const FORM_DATA: &str = r#"{"siid":"MIOffice-5G"}"#;

#[derive(Parser, Debug)]
#[command(name = "form-rewrite-plugin")]
#[command(about = "Remote plugin that rewrites request bodies to a fixed form", long_about = None)]
struct Args {
    /// Address to accept proxy connections on
    #[arg(short, long, default_value = "127.0.0.1:22803")]
    listen: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn rewrite(mut request: WireRequest) -> Result<WireResponse, RemoteError> {
    info!(
        request_id = %request.request_id,
        method = %request.method,
        url = %request.url,
        "Rewriting request body"
    );

    let body = form_body();
    request.content_length = body.len() as i64;
    request
        .header
        .insert("Content-Length".to_string(), vec![body.len().to_string()]);
    request.body = Bytes::from(body);

    Ok(WireResponse::pass_through(request))
}

fn form_body() -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair("data", FORM_DATA)
        .finish()
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();
    logging::init(args.debug, args.log_format);

    let listener = TcpListener::bind(&args.listen).await?;
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
        signal_token.cancel();
    });

    rpc::serve(listener, Arc::new(PluginFn(rewrite)), shutdown).await
}

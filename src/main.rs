use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::http::HeaderName;
use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bouncer::admission::AdmissionEngine;
use bouncer::config::BouncerConfig;
use bouncer::http::{AdmissionState, HttpServer};
use bouncer::store;

/// Request admission filter with distributed fixed-window rate limiting.
#[derive(Debug, Parser)]
#[command(name = "bouncer", version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "BOUNCER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address from the configuration
    #[arg(short, long)]
    listen: Option<std::net::SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Bouncer admission filter");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = BouncerConfig::load(args.config.as_deref()).map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        limit = config.admission.rate_limit.limit,
        window_secs = config.admission.rate_limit.window_secs,
        "Configuration loaded"
    );

    if args.check {
        info!("Configuration is valid");
        return Ok(());
    }

    let counter_store = store::from_config(&config.store).context("Failed to set up counter store")?;
    let engine = AdmissionEngine::new(config.admission, &config.store, counter_store)?;
    info!("Admission engine initialized");

    let mut state = AdmissionState::new(Arc::new(engine));
    if let Some(ref header) = config.server.forwarded_uri_header {
        let header = HeaderName::from_bytes(header.as_bytes())
            .context("Invalid server.forwarded_uri_header")?;
        info!(header = %header, "Reading checked path from forwarded URI header");
        state = state.with_forwarded_uri_header(header);
    }

    let server = HttpServer::new(config.server.listen_addr, state);
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Bouncer admission filter stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

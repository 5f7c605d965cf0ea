//! CLI for the o11y-canary synthetic probe.
//!
//! Loads the canary configuration, serves the probe's own metrics over HTTP
//! and runs every canary until interrupted.

mod server;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use o11y_canary::{BuildInfo, CanariesConfig, MetricsRegistry, Supervisor};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const SERVICE_NAME: &str = "o11y-canary";

/// o11y-canary: Synthetic write-then-query probe for metrics pipelines.
#[derive(Parser)]
#[command(name = "o11y-canary", version, about)]
struct Cli {
    /// Path to the canary configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Address the metrics endpoint listens on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = normalize_log_level(&cli.log_level);
    init_tracing(log_level);

    if let Err(e) = run(cli, log_level).await {
        tracing::error!("o11y-canary failed: {e}");
        std::process::exit(1);
    }
}

/// Maps the `--log-level` flag onto a filter directive. Unknown values fall
/// back to `info`.
fn normalize_log_level(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli, log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = CanariesConfig::load(&cli.config)?;
    config.validate()?;

    let version = env!("CARGO_PKG_VERSION");
    tracing::info!(
        service = SERVICE_NAME,
        version,
        config = %cli.config.display(),
        canaries = config.canaries.len(),
        "starting"
    );

    let metrics = MetricsRegistry::new()?;
    metrics.record_info(&BuildInfo {
        version: version.to_string(),
        log_level: log_level.to_string(),
        config_file: cli.config.display().to_string(),
        service_name: SERVICE_NAME.to_string(),
        service_namespace: SERVICE_NAME.to_string(),
    });

    let shutdown = CancellationToken::new();

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .map_err(|e| format!("metrics listener bind failed on {}: {e}", cli.listen))?;
    let server = tokio::spawn(server::serve(listener, metrics.clone(), shutdown.clone()));

    let mut supervisor = Supervisor::new(shutdown.clone());
    let started = supervisor.start_all(&config, &metrics);
    if started < config.canaries.len() {
        tracing::warn!(
            started,
            configured = config.canaries.len(),
            "some canaries failed to start"
        );
    }

    wait_for_signal().await;
    tracing::info!("shutting down");
    shutdown.cancel();

    supervisor.wait().await;
    if let Err(e) = server.await {
        tracing::warn!("metrics server task failed: {e}");
    }

    tracing::info!("o11y-canary exited cleanly");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

//! ETL Server - Main entry point

use anyhow::Result;
use etl_common::logging::{init_logging, LogConfig};
use std::sync::Arc;
use tokio::signal;
use tracing::info;

use etl_server::{
    api::{self, AppState},
    config::Config,
    etl::{runtime::ProcessRuntime, Cluster},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Environment variables take precedence over these defaults
    let log_config = LogConfig::builder()
        .log_file_prefix("etl-server")
        .filter_directives("etl_server=debug,tower_http=debug,axum=info")
        .build()
        .merge_env()?;

    init_logging(&log_config)?;

    info!("Starting ETL Server");

    let config = Config::load()?;
    let public_url = config.public_url()?;
    info!(
        addr = %config.bind_addr(),
        nodes = ?config.cluster.node_ids,
        pod_command = %config.cluster.pod_command,
        "Configuration loaded"
    );

    let runtime = Arc::new(ProcessRuntime::new(
        config.cluster.pod_command.clone(),
        config.cluster.pod_args.clone(),
        public_url.clone(),
    ));
    let cluster = Arc::new(Cluster::new(
        config.node_ids(),
        runtime,
        public_url,
        config.pod_config(),
    ));

    api::serve(&config, AppState { cluster }, shutdown_signal()).await?;

    info!("Server shut down gracefully");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}

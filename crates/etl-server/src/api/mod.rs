pub mod response;

use crate::config::Config;
use crate::etl::Cluster;
use crate::features;
use crate::middleware::{cors_layer, tracing_layer};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<Cluster>,
}

/// Serve the control surface until `shutdown` resolves, then stop every pod.
pub async fn serve(
    config: &Config,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state.clone(), config);

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    tracing::info!(addr = %listener.local_addr()?, "Listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    tracing::info!("Stopping pods");
    let grace = std::time::Duration::from_secs(config.server.shutdown_timeout_secs);
    if tokio::time::timeout(grace, state.cluster.shutdown()).await.is_err() {
        tracing::warn!(?grace, "Pods did not stop in time");
    }
    Ok(())
}

pub fn create_router(state: AppState, config: &Config) -> Router {
    let api_v1 = features::router(state.cluster.clone());

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest("/v1", api_v1)
        .layer(cors_layer(&config.cors))
        .layer(tracing_layer())
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "name": "ETL Server",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

//! Middleware for the control surface
//!
//! - CORS (Cross-Origin Resource Sharing)
//! - Request logging with tracing

use axum::http::{header, Method};
use std::time::Duration;
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::config::CorsConfig;

/// Create CORS layer from configuration
pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let mut cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::ACCEPT, header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(Duration::from_secs(3600));

    let wildcard =
        config.allowed_origins.is_empty() || config.allowed_origins.iter().any(|o| o == "*");
    if wildcard {
        cors = cors.allow_origin(Any);
    } else {
        let origins: Vec<_> = config
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        cors = cors.allow_origin(origins);
    }

    // tower-http refuses credentials together with a wildcard origin
    if config.allow_credentials && !wildcard {
        cors = cors.allow_credentials(true);
    } else if config.allow_credentials {
        tracing::warn!("CORS credentials ignored for wildcard origins");
    }

    cors
}

/// Create tracing/logging layer
pub fn tracing_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(
            DefaultOnResponse::new()
                .level(Level::INFO)
                .latency_unit(tower_http::LatencyUnit::Micros),
        )
}

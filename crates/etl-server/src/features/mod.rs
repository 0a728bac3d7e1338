//! Feature modules implementing the control API
//!
//! # Features
//!
//! - **etl**: create, inspect, stop, start and delete ETLs; per-node
//!   transforms; the pull-mode object callback

pub mod etl;

use axum::Router;
use std::sync::Arc;

use crate::etl::Cluster;

/// Creates the versioned API router with all feature routes mounted
///
/// - `/etl` - ETL lifecycle and data path
pub fn router(cluster: Arc<Cluster>) -> Router<()> {
    Router::new().nest("/etl", etl::etl_routes().with_state(cluster))
}

//! ETL Server Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Orchestrates user-defined transforms ("ETLs") attached to the data path of
//! a storage cluster.
//!
//! # Overview
//!
//! - **Packaging**: user callables are validated and rendered into a loadable
//!   code unit ([`etl::packager`])
//! - **Specs**: control requests are validated into immutable specs before any
//!   pod exists ([`etl::spec`])
//! - **Pods**: one transform instance per node, driven through
//!   `Initializing → Running → Stopped | Failed` ([`etl::lifecycle`])
//! - **Transport**: push, pull, streaming socket and stdio pipe exchange
//!   between a node and its pod ([`etl::transport`])
//! - **Control surface**: axum routes under `/v1/etl` ([`features`])
//!
//! # Example
//!
//! ```no_run
//! use etl_server::{api::{self, AppState}, config::Config};
//! use etl_server::etl::{runtime::ProcessRuntime, Cluster};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let url = config.public_url()?;
//!     let runtime = Arc::new(ProcessRuntime::new("etl-pod", vec![], url.clone()));
//!     let cluster = Arc::new(Cluster::new(config.node_ids(), runtime, url, config.pod_config()));
//!     api::serve(&config, AppState { cluster }, std::future::pending()).await
//! }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod etl;
pub mod features;
pub mod middleware;

// Re-export commonly used types
pub use error::{AppError, AppResult};

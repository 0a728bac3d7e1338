//! ETL control routes
//!
//! Every handler turns its request into a [`ControlRequest`](crate::etl::ControlRequest)
//! or a direct data-path call on the [`Cluster`](crate::etl::Cluster).

pub mod routes;

pub use routes::etl_routes;

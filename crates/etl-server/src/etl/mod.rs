//! ETL orchestration core
//!
//! Layers, leaves first:
//!
//! - [`packager`]: user callable + modules → loadable code unit
//! - [`spec`]: raw request → validated, immutable [`spec::EtlSpec`]
//! - [`transport`]: one [`transport::Channel`] per pod and comm mode
//! - [`runtime`]: how pods are launched ([`runtime::PodRuntime`])
//! - [`lifecycle`]: per-pod state machine
//! - [`node`] and [`cluster`]: pods per node, ETL registry
//! - [`webserver`]: the pod side of every comm mode

pub mod cluster;
pub mod lifecycle;
pub mod node;
pub mod packager;
pub mod runtime;
pub mod spec;
pub mod transport;
pub mod webserver;

pub use cluster::{Cluster, ControlRequest, ControlResponse, CreateResponse, EtlStatus};
pub use lifecycle::{Pod, PodConfig, PodStatus};
pub use spec::{EtlSpec, RawEtlSpec};

//! Pod runtimes
//!
//! A [`PodRuntime`] is the isolation boundary: it turns a validated spec into a
//! running pod and hands back how to reach it. The lifecycle manager owns the
//! returned [`PodProcess`] and never looks inside it.
//!
//! - [`ProcessRuntime`] spawns the runtime launcher as one OS process per pod.
//! - [`NativeRuntime`] serves a Rust [`Transformer`](crate::etl::webserver::Transformer)
//!   in-process over the same wire protocols.

pub mod native;
pub mod process;

use async_trait::async_trait;
use etl_common::error::Result;
use etl_common::types::NodeId;
use std::time::Duration;

use super::spec::EtlSpec;
use super::transport::PodEndpoint;

pub use native::NativeRuntime;
pub use process::ProcessRuntime;

/// A pod that has been launched but not necessarily probed yet.
pub struct LaunchedPod {
    pub endpoint: PodEndpoint,
    pub process: Box<dyn PodProcess>,
}

#[async_trait]
pub trait PodRuntime: Send + Sync {
    async fn launch(&self, spec: &EtlSpec, node: &NodeId) -> Result<LaunchedPod>;
}

/// Handle on a running pod's execution unit.
#[async_trait]
pub trait PodProcess: Send {
    /// OS process id, when there is one.
    fn id(&self) -> Option<u32>;

    /// Resolve when the pod exits on its own. Returns a description of the
    /// exit. Cancel safe.
    async fn wait(&mut self) -> String;

    /// Ask the pod to stop, forcing it after `grace`.
    async fn terminate(&mut self, grace: Duration);
}

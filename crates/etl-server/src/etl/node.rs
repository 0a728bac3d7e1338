//! Pods hosted by one storage node
//!
//! A node holds at most one pod per ETL. Pods on different nodes never share
//! state, so one node's failure leaves the others untouched.

use bytes::Bytes;
use etl_common::error::{EtlError, LifecycleError, Result};
use etl_common::types::NodeId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use url::Url;

use super::lifecycle::{Pod, PodConfig, PodStatus};
use super::runtime::PodRuntime;
use super::spec::EtlSpec;
use super::transport::{ChannelContext, PullStaging, StageOwner};

pub struct NodeManager {
    id: NodeId,
    runtime: Arc<dyn PodRuntime>,
    client: reqwest::Client,
    staging: Arc<PullStaging>,
    node_url: Url,
    config: PodConfig,
    pods: RwLock<HashMap<String, Arc<Pod>>>,
}

impl NodeManager {
    pub fn new(
        id: NodeId,
        runtime: Arc<dyn PodRuntime>,
        client: reqwest::Client,
        staging: Arc<PullStaging>,
        node_url: Url,
        config: PodConfig,
    ) -> Self {
        Self {
            id,
            runtime,
            client,
            staging,
            node_url,
            config,
            pods: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Make sure a live pod for `spec` exists on this node.
    ///
    /// A live pod built from an equal spec is kept as is; a terminal one is
    /// replaced by a fresh pod.
    pub async fn start_pod(&self, spec: Arc<EtlSpec>) -> Arc<Pod> {
        let mut pods = self.pods.write().await;
        if let Some(pod) = pods.get(spec.name()) {
            if pod.is_active() && pod.spec().digest() == spec.digest() {
                return pod.clone();
            }
            if pod.is_active() {
                // Different spec under the same name
                pod.stop().await;
            }
        }

        let ctx = ChannelContext {
            client: self.client.clone(),
            staging: self.staging.clone(),
            node_url: self.node_url.clone(),
            owner: StageOwner::new(spec.name(), self.id.clone()),
        };
        let name = spec.name().to_string();
        let pod = Pod::launch(spec, self.id.clone(), self.runtime.clone(), ctx, self.config.clone()).await;
        pods.insert(name, pod.clone());
        pod
    }

    pub async fn pod(&self, name: &str) -> Option<Arc<Pod>> {
        self.pods.read().await.get(name).cloned()
    }

    async fn require(&self, name: &str) -> Result<Arc<Pod>> {
        self.pod(name)
            .await
            .ok_or_else(|| EtlError::NotFound(format!("ETL '{}' on node {}", name, self.id)))
    }

    pub async fn stop_pod(&self, name: &str) -> Result<()> {
        self.require(name).await?.stop().await;
        Ok(())
    }

    pub async fn status(&self, name: &str) -> Option<PodStatus> {
        self.pod(name).await.map(|pod| pod.status())
    }

    pub async fn transform(&self, name: &str, data: Bytes) -> Result<Bytes> {
        self.require(name).await?.transform(data).await
    }

    pub async fn has_active(&self, name: &str) -> bool {
        self.pod(name).await.is_some_and(|pod| pod.is_active())
    }

    /// Forget a terminal pod.
    pub async fn remove_pod(&self, name: &str) -> Result<()> {
        let mut pods = self.pods.write().await;
        match pods.get(name) {
            Some(pod) if pod.is_active() => Err(LifecycleError::StillActive(name.to_string()).into()),
            Some(_) => {
                pods.remove(name);
                Ok(())
            },
            None => Ok(()),
        }
    }

    /// Stop every pod on this node.
    pub async fn shutdown(&self) {
        let pods: Vec<Arc<Pod>> = self.pods.read().await.values().cloned().collect();
        futures::future::join_all(pods.iter().map(|pod| pod.stop())).await;
    }
}

//! Cluster-wide ETL registry
//!
//! The [`Cluster`] owns the name → spec registry and one [`NodeManager`] per
//! node. Control operations fan out to every node concurrently; status is
//! always reported per node.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use etl_common::error::{EtlError, LifecycleError, Result};
use etl_common::types::NodeId;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use url::Url;
use uuid::Uuid;

use super::lifecycle::{Pod, PodConfig, PodStatus};
use super::node::NodeManager;
use super::runtime::PodRuntime;
use super::spec::{EtlSpec, RawEtlSpec};
use super::transport::PullStaging;

/// One control-plane operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Create { spec: RawEtlSpec },
    Status { name: String },
    Stop { name: String },
    Start { name: String },
    Delete { name: String },
    List,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ControlResponse {
    Created(CreateResponse),
    Status(EtlStatus),
    Deleted { deleted: String },
    List(Vec<EtlStatus>),
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateResponse {
    pub job_id: Uuid,
    #[serde(flatten)]
    pub etl: EtlStatus,
}

/// Spec plus the status of its pod on every node.
#[derive(Debug, Clone, Serialize)]
pub struct EtlStatus {
    pub spec: EtlSpec,
    pub digest: String,
    pub created_at: DateTime<Utc>,
    pub nodes: BTreeMap<NodeId, Option<PodStatus>>,
}

struct EtlEntry {
    spec: Arc<EtlSpec>,
    created_at: DateTime<Utc>,
}

pub struct Cluster {
    nodes: BTreeMap<NodeId, NodeManager>,
    registry: RwLock<BTreeMap<String, EtlEntry>>,
    staging: Arc<PullStaging>,
}

impl Cluster {
    /// Build a cluster whose pods call back into `node_url`.
    pub fn new(
        node_ids: impl IntoIterator<Item = NodeId>,
        runtime: Arc<dyn PodRuntime>,
        node_url: Url,
        config: PodConfig,
    ) -> Self {
        let client = reqwest::Client::new();
        let staging = Arc::new(PullStaging::new());
        let nodes = node_ids
            .into_iter()
            .map(|id| {
                let node = NodeManager::new(
                    id.clone(),
                    runtime.clone(),
                    client.clone(),
                    staging.clone(),
                    node_url.clone(),
                    config.clone(),
                );
                (id, node)
            })
            .collect();

        Self {
            nodes,
            registry: RwLock::new(BTreeMap::new()),
            staging,
        }
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn staging(&self) -> &Arc<PullStaging> {
        &self.staging
    }

    fn node(&self, id: &NodeId) -> Result<&NodeManager> {
        self.nodes
            .get(id)
            .ok_or_else(|| EtlError::NotFound(format!("node {}", id)))
    }

    async fn entry_spec(&self, name: &str) -> Result<(Arc<EtlSpec>, DateTime<Utc>)> {
        self.registry
            .read()
            .await
            .get(name)
            .map(|e| (e.spec.clone(), e.created_at))
            .ok_or_else(|| EtlError::NotFound(format!("ETL '{}'", name)))
    }

    async fn describe(&self, spec: &EtlSpec, created_at: DateTime<Utc>) -> EtlStatus {
        let statuses = join_all(self.nodes.values().map(|node| node.status(spec.name()))).await;
        EtlStatus {
            spec: spec.clone(),
            digest: spec.digest(),
            created_at,
            nodes: self.nodes.keys().cloned().zip(statuses).collect(),
        }
    }

    /// Validate `raw` and start a pod for it on every node.
    ///
    /// Re-creating an ETL with an identical spec is a no-op; a different spec
    /// under an existing name is rejected.
    #[tracing::instrument(skip(self, raw), fields(etl = %raw.name))]
    pub async fn create(&self, raw: &RawEtlSpec) -> Result<CreateResponse> {
        let spec = Arc::new(EtlSpec::validate(raw)?);
        let job_id = Uuid::new_v4();

        let created_at = {
            let mut registry = self.registry.write().await;
            match registry.get(spec.name()) {
                Some(existing) if existing.spec.digest() == spec.digest() => {
                    tracing::debug!(%job_id, "ETL already exists with the same spec");
                    let created_at = existing.created_at;
                    drop(registry);
                    return Ok(CreateResponse {
                        job_id,
                        etl: self.describe(&spec, created_at).await,
                    });
                },
                Some(_) => return Err(EtlError::AlreadyExists(spec.name().to_string())),
                None => {
                    let created_at = Utc::now();
                    registry.insert(
                        spec.name().to_string(),
                        EtlEntry {
                            spec: spec.clone(),
                            created_at,
                        },
                    );
                    created_at
                },
            }
        };

        join_all(self.nodes.values().map(|node| node.start_pod(spec.clone()))).await;
        tracing::info!(%job_id, nodes = self.nodes.len(), comm = %spec.comm(), "ETL created");

        Ok(CreateResponse {
            job_id,
            etl: self.describe(&spec, created_at).await,
        })
    }

    pub async fn status(&self, name: &str) -> Result<EtlStatus> {
        let (spec, created_at) = self.entry_spec(name).await?;
        Ok(self.describe(&spec, created_at).await)
    }

    pub async fn list(&self) -> Vec<EtlStatus> {
        let entries: Vec<(Arc<EtlSpec>, DateTime<Utc>)> = self
            .registry
            .read()
            .await
            .values()
            .map(|e| (e.spec.clone(), e.created_at))
            .collect();
        let mut out = Vec::with_capacity(entries.len());
        for (spec, created_at) in entries {
            out.push(self.describe(&spec, created_at).await);
        }
        out
    }

    /// Stop the ETL's pods on every node.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self, name: &str) -> Result<EtlStatus> {
        let (spec, created_at) = self.entry_spec(name).await?;
        let results = join_all(self.nodes.values().map(|node| node.stop_pod(name))).await;
        for (node, result) in self.nodes.keys().zip(results) {
            if let Err(e) = result {
                tracing::debug!(node = %node, error = %e, "No pod to stop");
            }
        }
        tracing::info!("ETL stopped");
        Ok(self.describe(&spec, created_at).await)
    }

    /// Start fresh pods for an ETL whose pods have stopped or failed.
    ///
    /// Nodes that still run a live pod keep it.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self, name: &str) -> Result<EtlStatus> {
        let registry = self.registry.read().await;
        let entry = registry
            .get(name)
            .ok_or_else(|| EtlError::NotFound(format!("ETL '{}'", name)))?;
        let (spec, created_at) = (entry.spec.clone(), entry.created_at);
        join_all(self.nodes.values().map(|node| node.start_pod(spec.clone()))).await;
        drop(registry);

        tracing::info!("ETL started");
        Ok(self.describe(&spec, created_at).await)
    }

    /// Remove an ETL whose pods are all terminal.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.write().await;
        if !registry.contains_key(name) {
            return Err(EtlError::NotFound(format!("ETL '{}'", name)));
        }
        for node in self.nodes.values() {
            if node.has_active(name).await {
                return Err(LifecycleError::StillActive(name.to_string()).into());
            }
        }
        for node in self.nodes.values() {
            node.remove_pod(name).await?;
        }
        registry.remove(name);
        tracing::info!("ETL deleted");
        Ok(())
    }

    /// Transform one object with the ETL's pod on `node`.
    pub async fn transform(&self, name: &str, node: &NodeId, data: Bytes) -> Result<Bytes> {
        self.entry_spec(name).await?;
        self.node(node)?.transform(name, data).await
    }

    /// The ETL's current pod on `node`, if one was ever started there.
    pub async fn pod(&self, name: &str, node: &NodeId) -> Option<Arc<Pod>> {
        self.nodes.get(node)?.pod(name).await
    }

    /// Serve a staged object to the pod calling back for it.
    pub fn fetch_object(&self, id: u64) -> Result<Bytes> {
        self.staging.take(id)
    }

    pub async fn handle(&self, request: ControlRequest) -> Result<ControlResponse> {
        match request {
            ControlRequest::Create { spec } => self.create(&spec).await.map(ControlResponse::Created),
            ControlRequest::Status { name } => self.status(&name).await.map(ControlResponse::Status),
            ControlRequest::Stop { name } => self.stop(&name).await.map(ControlResponse::Status),
            ControlRequest::Start { name } => self.start(&name).await.map(ControlResponse::Status),
            ControlRequest::Delete { name } => {
                self.delete(&name).await?;
                Ok(ControlResponse::Deleted { deleted: name })
            },
            ControlRequest::List => Ok(ControlResponse::List(self.list().await)),
        }
    }

    /// Stop every pod on every node.
    pub async fn shutdown(&self) {
        join_all(self.nodes.values().map(|node| node.shutdown())).await;
        tracing::info!(nodes = self.nodes.len(), "Cluster shut down");
    }
}

//! `hpull`: the pod fetches the object from the node, the node pulls the result
//!
//! 1. The node stages the object under a fresh correlation id.
//! 2. `POST {pod}/pull {"id", "url"}` tells the pod where to fetch it.
//! 3. The pod calls `GET {node}/v1/etl/objects/{id}` and transforms the bytes.
//! 4. The node polls `GET {pod}/results/{id}` (202 while pending).
//!
//! Staged objects are keyed by owner. When a pod stops, its outstanding ids
//! are tombstoned so a late callback gets a lifecycle error instead of data.

use async_trait::async_trait;
use bytes::Bytes;
use etl_common::error::{EtlError, LifecycleError, Result, TransportError};
use etl_common::types::{CommMode, CorrelationId, CorrelationSeq, NodeId};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::{http_failure, within, Channel, TransferHandle};

/// How often the node asks a pod whether a result is ready.
pub const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Tombstones kept for ids of stopped pods.
const MAX_TOMBSTONES: usize = 4096;

/// The pod a staged object belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageOwner {
    pub etl: String,
    pub node: NodeId,
}

impl StageOwner {
    pub fn new(etl: impl Into<String>, node: impl Into<NodeId>) -> Self {
        Self {
            etl: etl.into(),
            node: node.into(),
        }
    }
}

impl fmt::Display for StageOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.etl, self.node)
    }
}

/// Body of `POST /pull`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: u64,
    pub url: String,
}

#[derive(Default)]
struct StagingState {
    objects: HashMap<u64, (StageOwner, Bytes)>,
    tombstones: HashSet<u64>,
    tombstone_order: VecDeque<u64>,
}

/// Node-wide store of objects waiting for a pod callback.
pub struct PullStaging {
    seq: CorrelationSeq,
    state: Mutex<StagingState>,
}

impl PullStaging {
    pub fn new() -> Self {
        Self {
            seq: CorrelationSeq::new(),
            state: Mutex::new(StagingState::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StagingState>> {
        self.state
            .lock()
            .map_err(|_| TransportError::ConnectionLost("staging lock poisoned".into()).into())
    }

    pub fn stage(&self, owner: &StageOwner, data: Bytes) -> Result<CorrelationId> {
        let id = self.seq.next();
        self.lock()?.objects.insert(id.0, (owner.clone(), data));
        Ok(id)
    }

    /// Hand a staged object to the pod calling back for it.
    ///
    /// Each object can be taken once.
    pub fn take(&self, id: u64) -> Result<Bytes> {
        let mut state = self.lock()?;
        if state.tombstones.contains(&id) {
            return Err(LifecycleError::LateCallback(id).into());
        }
        state
            .objects
            .remove(&id)
            .map(|(_, data)| data)
            .ok_or_else(|| EtlError::NotFound(format!("staged object {}", id)))
    }

    /// Drop an object nobody will fetch anymore.
    pub fn discard(&self, id: u64) {
        if let Ok(mut state) = self.lock() {
            state.objects.remove(&id);
        }
    }

    /// Release everything staged for `owner`. Returns how many objects were
    /// still waiting.
    pub fn close_owner(&self, owner: &StageOwner) -> usize {
        let Ok(mut state) = self.lock() else {
            return 0;
        };
        let ids: Vec<u64> = state
            .objects
            .iter()
            .filter(|(_, (o, _))| o == owner)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            state.objects.remove(id);
            state.tombstones.insert(*id);
            state.tombstone_order.push_back(*id);
        }
        while state.tombstone_order.len() > MAX_TOMBSTONES {
            if let Some(old) = state.tombstone_order.pop_front() {
                state.tombstones.remove(&old);
            }
        }
        ids.len()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PullStaging {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP pull channel.
pub struct PullChannel {
    client: reqwest::Client,
    endpoint: Url,
    staging: Arc<PullStaging>,
    owner: StageOwner,
    node_url: Url,
    closed: AtomicBool,
}

impl PullChannel {
    pub fn new(
        client: reqwest::Client,
        endpoint: Url,
        staging: Arc<PullStaging>,
        owner: StageOwner,
        node_url: Url,
    ) -> Self {
        Self {
            client,
            endpoint,
            staging,
            owner,
            node_url,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed.into());
        }
        Ok(())
    }

    fn pod_url(&self, path: &str) -> Result<Url> {
        self.endpoint
            .join(path)
            .map_err(|e| TransportError::ConnectionLost(e.to_string()).into())
    }

    /// URL the pod uses to fetch staged object `id`.
    pub fn object_url(&self, id: u64) -> Result<Url> {
        self.node_url
            .join(&format!("v1/etl/objects/{}", id))
            .map_err(|e| TransportError::ConnectionLost(e.to_string()).into())
    }

    async fn notify(&self, request: &PullRequest) -> Result<()> {
        let response = self
            .client
            .post(self.pod_url("pull")?)
            .json(request)
            .send()
            .await
            .map_err(http_failure)?;
        if !response.status().is_success() {
            return Err(TransportError::Rejected {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            }
            .into());
        }
        Ok(())
    }

    /// Ask the pod to drop the result of `id` without waiting for it.
    fn forget_result(&self, id: u64) {
        let Ok(url) = self.pod_url(&format!("results/{}", id)) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = self.client.clone();
        runtime.spawn(async move {
            if let Err(e) = client.delete(url).send().await {
                tracing::debug!(id, error = %e, "Dropping pod result failed");
            }
        });
    }

    async fn poll_result(&self, id: u64) -> Result<Bytes> {
        let url = self.pod_url(&format!("results/{}", id))?;
        loop {
            self.ensure_open()?;
            let response = self.client.get(url.clone()).send().await.map_err(http_failure)?;
            match response.status() {
                StatusCode::ACCEPTED => tokio::time::sleep(RESULT_POLL_INTERVAL).await,
                status if status.is_success() => {
                    return response.bytes().await.map_err(http_failure);
                },
                status => {
                    let message = response.text().await.unwrap_or_default();
                    return Err(TransportError::Rejected {
                        status: status.as_u16(),
                        message,
                    }
                    .into());
                },
            }
        }
    }
}

/// Releases a transfer's staged object, and its pod-side result unless the
/// result was collected, when dropped. Covers futures dropped mid-await.
struct TransferGuard<'a> {
    channel: &'a PullChannel,
    id: u64,
    armed: bool,
    collected: bool,
}

impl<'a> TransferGuard<'a> {
    fn new(channel: &'a PullChannel, id: u64) -> Self {
        Self {
            channel,
            id,
            armed: true,
            collected: false,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.channel.staging.discard(self.id);
        if !self.collected {
            self.channel.forget_result(self.id);
        }
    }
}

#[async_trait]
impl Channel for PullChannel {
    fn mode(&self) -> CommMode {
        CommMode::Pull
    }

    async fn send(&self, data: Bytes) -> Result<TransferHandle> {
        self.ensure_open()?;
        let id = self.staging.stage(&self.owner, data)?;
        let request = PullRequest {
            id: id.0,
            url: self.object_url(id.0)?.to_string(),
        };

        let guard = TransferGuard::new(self, id.0);
        self.notify(&request).await?;
        // From here on the caller owns the transfer through its handle
        guard.disarm();
        Ok(TransferHandle(id))
    }

    async fn receive(&self, handle: TransferHandle, timeout: Duration) -> Result<Bytes> {
        // The pod may never have called back
        let mut guard = TransferGuard::new(self, handle.id());
        let result = within(timeout, self.poll_result(handle.id())).await;
        guard.collected = result.is_ok();
        result
    }

    async fn cancel(&self, handle: TransferHandle) -> Result<()> {
        self.staging.discard(handle.id());
        if let Ok(url) = self.pod_url(&format!("results/{}", handle.id())) {
            // Best effort; the pod drops unclaimed results on its own.
            let _ = self.client.delete(url).send().await;
        }
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        self.ensure_open()?;
        let response = self
            .client
            .get(self.pod_url("health")?)
            .send()
            .await
            .map_err(http_failure)?;
        if !response.status().is_success() {
            return Err(TransportError::Rejected {
                status: response.status().as_u16(),
                message: "pod is not ready".to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let pending = self.staging.close_owner(&self.owner);
        if pending > 0 {
            tracing::debug!(owner = %self.owner, pending, "Tombstoned staged objects");
        }
        Ok(())
    }
}

//! `hpush`: the node PUTs the object and reads the transformed body back

use async_trait::async_trait;
use bytes::Bytes;
use etl_common::error::{EtlError, Result, TransportError};
use etl_common::types::{CommMode, CorrelationSeq};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use url::Url;

use super::{http_failure, Channel, TransferHandle};

/// HTTP push channel. The reqwest client pools connections to the pod.
pub struct PushChannel {
    client: reqwest::Client,
    endpoint: Url,
    seq: CorrelationSeq,
    pending: Mutex<HashMap<u64, JoinHandle<Result<Bytes>>>>,
    closed: AtomicBool,
}

impl PushChannel {
    pub fn new(client: reqwest::Client, endpoint: Url) -> Self {
        Self {
            client,
            endpoint,
            seq: CorrelationSeq::new(),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed.into());
        }
        Ok(())
    }

    fn take_pending(&self, handle: TransferHandle) -> Result<JoinHandle<Result<Bytes>>> {
        self.pending
            .lock()
            .map_err(|_| TransportError::Closed)?
            .remove(&handle.id())
            .ok_or_else(|| TransportError::UnknownHandle(handle.id()).into())
    }
}

/// Aborts the PUT when the transfer is dropped before its response arrived.
struct AbortOnDrop(JoinHandle<Result<Bytes>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn put_object(client: reqwest::Client, url: Url, data: Bytes) -> Result<Bytes> {
    let response = client.put(url).body(data).send().await.map_err(http_failure)?;
    let status = response.status();
    let body = response.bytes().await.map_err(http_failure)?;
    if !status.is_success() {
        return Err(TransportError::Rejected {
            status: status.as_u16(),
            message: String::from_utf8_lossy(&body).into_owned(),
        }
        .into());
    }
    Ok(body)
}

#[async_trait]
impl Channel for PushChannel {
    fn mode(&self) -> CommMode {
        CommMode::Push
    }

    async fn send(&self, data: Bytes) -> Result<TransferHandle> {
        self.ensure_open()?;
        let handle = TransferHandle(self.seq.next());
        let task = tokio::spawn(put_object(self.client.clone(), self.endpoint.clone(), data));
        self.pending
            .lock()
            .map_err(|_| TransportError::Closed)?
            .insert(handle.id(), task);
        Ok(handle)
    }

    async fn receive(&self, handle: TransferHandle, timeout: Duration) -> Result<Bytes> {
        let mut task = AbortOnDrop(self.take_pending(handle)?);
        match tokio::time::timeout(timeout, &mut task.0).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(TransportError::ConnectionLost(join.to_string()).into()),
            Err(_) => Err(EtlError::Timeout(timeout)),
        }
    }

    async fn cancel(&self, handle: TransferHandle) -> Result<()> {
        match self.take_pending(handle) {
            Ok(task) => {
                task.abort();
                Ok(())
            },
            // Already redeemed by receive
            Err(EtlError::Transport(TransportError::UnknownHandle(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn probe(&self) -> Result<()> {
        self.ensure_open()?;
        let url = self
            .endpoint
            .join("health")
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
        let response = self.client.get(url).send().await.map_err(http_failure)?;
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
        if let Ok(mut pending) = self.pending.lock() {
            for (_, task) in pending.drain() {
                task.abort();
            }
        }
        Ok(())
    }
}

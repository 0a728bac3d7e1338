//! In-process pods
//!
//! Every pod serves the same [`Transformer`] over the real wire protocol of
//! its comm mode, so the node side cannot tell it from a launched process.
//! Pods can be killed on demand to exercise failure handling.

use async_trait::async_trait;
use etl_common::error::{Result, TransportError};
use etl_common::types::{CommMode, NodeId};
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{LaunchedPod, PodProcess, PodRuntime};
use crate::etl::packager::CodeArtifact;
use crate::etl::spec::EtlSpec;
use crate::etl::transport::PodEndpoint;
use crate::etl::webserver::{self, PodState, Transformer};

/// Buffer size of the in-memory stdio pipes.
const PIPE_BUFFER: usize = 64 * 1024;

type PodKey = (String, NodeId);

/// Kill switch of one launch; a relaunch under the same key replaces it.
struct KillSwitch {
    launch: u64,
    token: CancellationToken,
}

type KillSwitches = Arc<Mutex<HashMap<PodKey, KillSwitch>>>;

/// Hosts pods as tasks in the current process.
pub struct NativeRuntime {
    transformer: Arc<dyn Transformer>,
    client: reqwest::Client,
    startup_delay: Duration,
    refused: Mutex<HashSet<NodeId>>,
    kill_switches: KillSwitches,
    launches: AtomicU64,
}

impl NativeRuntime {
    pub fn new(transformer: Arc<dyn Transformer>) -> Self {
        Self {
            transformer,
            client: reqwest::Client::new(),
            startup_delay: Duration::ZERO,
            refused: Mutex::new(HashSet::new()),
            kill_switches: Arc::new(Mutex::new(HashMap::new())),
            launches: AtomicU64::new(0),
        }
    }

    /// Pods become ready only after `delay`.
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Fail every later launch on `node`.
    pub fn refuse_node(&self, node: impl Into<NodeId>) {
        if let Ok(mut refused) = self.refused.lock() {
            refused.insert(node.into());
        }
    }

    /// Kill the pod of `etl` on `node` as if its process crashed.
    ///
    /// Returns `false` when no such pod was launched.
    pub fn kill(&self, etl: &str, node: impl Into<NodeId>) -> bool {
        let key = (etl.to_string(), node.into());
        let switch = self
            .kill_switches
            .lock()
            .ok()
            .and_then(|mut switches| switches.remove(&key));
        match switch {
            Some(switch) => {
                tracing::info!(etl, node = %key.1, "Killing native pod");
                switch.token.cancel();
                true
            },
            None => false,
        }
    }

    /// Pods that can still be killed.
    pub fn live_pods(&self) -> usize {
        self.kill_switches.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn is_refused(&self, node: &NodeId) -> bool {
        self.refused.lock().map(|r| r.contains(node)).unwrap_or(false)
    }

    async fn serve(&self, spec: &EtlSpec, serving: CancellationToken) -> Result<PodEndpoint> {
        let transformer = self.transformer.clone();
        let delay = self.startup_delay;

        match spec.comm() {
            CommMode::Push | CommMode::Pull => {
                let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
                let addr = listener.local_addr()?;
                let state = PodState::new(transformer, self.client.clone(), spec.arg_type())
                    .ready_at(Instant::now() + delay);
                tokio::spawn(webserver::serve_http(listener, state, serving));
                let url = Url::parse(&format!("http://{}/", addr))
                    .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
                Ok(PodEndpoint::Http(url))
            },
            CommMode::StreamingSocket => {
                let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
                let addr: SocketAddr = listener.local_addr()?;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    webserver::serve_socket(listener, transformer, serving).await;
                });
                Ok(PodEndpoint::Socket(addr))
            },
            CommMode::Pipe => {
                let (node_stdin, pod_stdin) = tokio::io::duplex(PIPE_BUFFER);
                let (pod_stdout, node_stdout) = tokio::io::duplex(PIPE_BUFFER);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    webserver::serve_pipe(pod_stdin, pod_stdout, transformer, serving).await;
                });
                Ok(PodEndpoint::pipe(Box::new(node_stdin), Box::new(node_stdout)))
            },
        }
    }
}

#[async_trait]
impl PodRuntime for NativeRuntime {
    async fn launch(&self, spec: &EtlSpec, node: &NodeId) -> Result<LaunchedPod> {
        if self.is_refused(node) {
            return Err(TransportError::ProcessExited(format!("pod on {} failed to start", node)).into());
        }

        // A pod only ever sees the encoded unit; make sure it unpacks.
        CodeArtifact::decode(&spec.artifact().encoded())?;

        // Killing cancels serving too; terminating leaves the kill switch alone.
        let killed = CancellationToken::new();
        let serving = killed.child_token();
        let endpoint = self.serve(spec, serving.clone()).await?;

        let key = (spec.name().to_string(), node.clone());
        let launch = self.launches.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut switches) = self.kill_switches.lock() {
            switches.insert(
                key.clone(),
                KillSwitch {
                    launch,
                    token: killed.clone(),
                },
            );
        }
        tracing::debug!(etl = %spec.name(), node = %node, endpoint = %endpoint.describe(), "Native pod launched");

        Ok(LaunchedPod {
            endpoint,
            process: Box::new(NativeProcess {
                serving,
                killed,
                switches: self.kill_switches.clone(),
                key,
                launch,
            }),
        })
    }
}

struct NativeProcess {
    serving: CancellationToken,
    killed: CancellationToken,
    switches: KillSwitches,
    key: PodKey,
    launch: u64,
}

impl NativeProcess {
    /// Stop serving and drop this launch's kill switch.
    fn release(&self) {
        self.serving.cancel();
        if let Ok(mut switches) = self.switches.lock() {
            if switches.get(&self.key).is_some_and(|s| s.launch == self.launch) {
                switches.remove(&self.key);
            }
        }
    }
}

#[async_trait]
impl PodProcess for NativeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> String {
        self.killed.cancelled().await;
        "killed".to_string()
    }

    async fn terminate(&mut self, _grace: Duration) {
        self.release();
    }
}

impl Drop for NativeProcess {
    fn drop(&mut self) {
        self.release();
    }
}

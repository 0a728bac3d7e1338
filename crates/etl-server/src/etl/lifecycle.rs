//! Per-pod lifecycle state machine
//!
//! ```text
//!                 probe ok              stop
//! Initializing ─────────────▶ Running ────────▶ Stopped
//!      │  │                      │
//!      │  └── stop ──▶ Stopped   └── process exit / fatal transport /
//!      │                             missed heartbeats ──▶ Failed
//!      └── launch error / no probe within timeout ──▶ Failed
//! ```
//!
//! Every transition goes through the pod's async mutex. Background work (the
//! startup task, the process watcher and the heartbeat) runs in tasks tied to
//! one cancellation token; reaching a terminal stage cancels it, which
//! releases the process and the channel.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use etl_common::error::{LifecycleError, Result, TransportError};
use etl_common::types::{NodeId, PodStage};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::runtime::{LaunchedPod, PodProcess, PodRuntime};
use super::spec::EtlSpec;
use super::transport::{connect, within, Channel, ChannelContext};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Shortest heartbeat period ever used.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Timing knobs shared by all pods of a node.
#[derive(Debug, Clone)]
pub struct PodConfig {
    /// Upper bound for the heartbeat period
    pub heartbeat_interval: Duration,
    /// Consecutive misses after which a running pod fails
    pub max_missed_heartbeats: u32,
    /// Pause between readiness probes during startup
    pub probe_interval: Duration,
    /// Time a pod gets to exit after being asked to stop
    pub stop_grace: Duration,
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

impl PodConfig {
    /// Heartbeat period for `spec`: always shorter than its timeout.
    pub fn heartbeat_for(&self, spec: &EtlSpec) -> Duration {
        self.heartbeat_interval
            .min(spec.timeout() / 2)
            .max(MIN_HEARTBEAT_INTERVAL)
    }
}

/// Point-in-time view of one pod.
#[derive(Debug, Clone, Serialize)]
pub struct PodStatus {
    pub node: NodeId,
    #[serde(flatten)]
    pub stage: PodStage,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub endpoint: Option<String>,
    pub missed_heartbeats: u32,
    /// Transfers that timed out in a row; only a completed transfer resets it
    pub consecutive_timeouts: u32,
}

struct PodInner {
    stage: PodStage,
    channel: Option<Arc<dyn Channel>>,
    tasks: Vec<JoinHandle<()>>,
}

/// One transform instance on one node.
pub struct Pod {
    spec: Arc<EtlSpec>,
    node: NodeId,
    config: PodConfig,
    inner: Mutex<PodInner>,
    status: watch::Sender<PodStatus>,
    misses: AtomicU32,
    timeouts: AtomicU32,
    token: CancellationToken,
}

impl Pod {
    /// Create a pod in `Initializing` and start bringing it up.
    pub async fn launch(
        spec: Arc<EtlSpec>,
        node: NodeId,
        runtime: Arc<dyn PodRuntime>,
        ctx: ChannelContext,
        config: PodConfig,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(PodStatus {
            node: node.clone(),
            stage: PodStage::Initializing,
            created_at: Utc::now(),
            last_heartbeat: None,
            endpoint: None,
            missed_heartbeats: 0,
            consecutive_timeouts: 0,
        });
        let pod = Arc::new(Self {
            spec,
            node,
            config,
            inner: Mutex::new(PodInner {
                stage: PodStage::Initializing,
                channel: None,
                tasks: Vec::new(),
            }),
            status,
            misses: AtomicU32::new(0),
            timeouts: AtomicU32::new(0),
            token: CancellationToken::new(),
        });

        tracing::info!(etl = %pod.spec.name(), node = %pod.node, comm = %pod.spec.comm(), "Initializing pod");

        // Hold the lock so the startup task cannot publish Running before its
        // own handle is recorded.
        let mut inner = pod.inner.lock().await;
        let task = tokio::spawn(pod.clone().initialize(runtime, ctx));
        inner.tasks.push(task);
        drop(inner);

        pod
    }

    pub fn spec(&self) -> &Arc<EtlSpec> {
        &self.spec
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn status(&self) -> PodStatus {
        self.status.borrow().clone()
    }

    pub fn stage(&self) -> PodStage {
        self.status.borrow().stage.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PodStatus> {
        self.status.subscribe()
    }

    /// Wait until the stage satisfies `done` and return it.
    pub async fn wait_for_stage(&self, mut done: impl FnMut(&PodStage) -> bool) -> PodStage {
        let mut rx = self.status.subscribe();
        let stage = match rx.wait_for(|s| done(&s.stage)).await {
            Ok(status) => status.stage.clone(),
            Err(_) => self.stage(),
        };
        stage
    }

    /// Wait until the pod has left `Initializing`.
    pub async fn wait_settled(&self) -> PodStage {
        self.wait_for_stage(|s| *s != PodStage::Initializing).await
    }

    pub fn is_active(&self) -> bool {
        !self.stage().is_terminal()
    }

    fn transition(&self, inner: &mut PodInner, next: PodStage) -> bool {
        if !inner.stage.can_transition_to(&next) {
            tracing::debug!(
                etl = %self.spec.name(),
                node = %self.node,
                from = %inner.stage,
                to = %next,
                "Ignoring transition"
            );
            return false;
        }
        tracing::info!(etl = %self.spec.name(), node = %self.node, from = %inner.stage, to = %next, "Pod transition");
        inner.stage = next.clone();
        self.status.send_modify(|s| s.stage = next);
        true
    }

    // ------------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------------

    async fn initialize(self: Arc<Self>, runtime: Arc<dyn PodRuntime>, ctx: ChannelContext) {
        let timeout = self.spec.timeout();
        let outcome = tokio::select! {
            _ = self.token.cancelled() => return,
            outcome = within(timeout, self.bring_up(runtime.as_ref(), &ctx)) => outcome,
        };

        let (channel, process) = match outcome {
            Ok(ready) => ready,
            Err(e) => {
                let reason = if e.is_timeout() {
                    format!("pod not ready within {:?}", timeout)
                } else {
                    e.to_string()
                };
                self.fail(reason).await;
                return;
            },
        };

        let mut inner = self.inner.lock().await;
        if !self.transition(&mut inner, PodStage::Running) {
            // Stopped while the last probe was in flight
            drop(inner);
            let _ = channel.close().await;
            let mut process = process;
            process.terminate(self.config.stop_grace).await;
            return;
        }
        inner.channel = Some(channel.clone());
        inner.tasks.push(tokio::spawn(self.clone().watch_process(process)));
        inner.tasks.push(tokio::spawn(self.clone().heartbeat(channel)));
        self.status.send_modify(|s| s.last_heartbeat = Some(Utc::now()));
    }

    /// Launch, connect and probe until the pod answers.
    async fn bring_up(
        &self,
        runtime: &dyn PodRuntime,
        ctx: &ChannelContext,
    ) -> Result<(Arc<dyn Channel>, Box<dyn PodProcess>)> {
        let LaunchedPod {
            mut endpoint,
            mut process,
        } = runtime.launch(&self.spec, &self.node).await?;
        let described = endpoint.describe();
        self.status.send_modify(|s| s.endpoint = Some(described));

        let ready = async {
            let probe_timeout = self.config.heartbeat_for(&self.spec);
            let channel = loop {
                match connect(self.spec.comm(), &mut endpoint, ctx).await {
                    Ok(channel) => break channel,
                    Err(e) if e.is_fatal_transport() => {
                        tracing::trace!(node = %self.node, error = %e, "Pod not accepting connections yet");
                        tokio::time::sleep(self.config.probe_interval).await;
                    },
                    Err(e) => return Err(e),
                }
            };
            loop {
                match within(probe_timeout, channel.probe()).await {
                    Ok(()) => return Ok(channel),
                    Err(e) => {
                        tracing::trace!(node = %self.node, error = %e, "Readiness probe failed");
                        tokio::time::sleep(self.config.probe_interval).await;
                    },
                }
            }
        };

        let outcome: Result<Arc<dyn Channel>> = tokio::select! {
            status = process.wait() => Err(TransportError::ProcessExited(status).into()),
            ready = ready => ready,
        };
        outcome.map(|channel| (channel, process))
    }

    // ------------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------------

    async fn watch_process(self: Arc<Self>, mut process: Box<dyn PodProcess>) {
        tokio::select! {
            _ = self.token.cancelled() => {
                process.terminate(self.config.stop_grace).await;
            },
            status = process.wait() => {
                self.fail(TransportError::ProcessExited(status).to_string()).await;
            },
        }
    }

    async fn heartbeat(self: Arc<Self>, channel: Arc<dyn Channel>) {
        let interval = self.config.heartbeat_for(&self.spec);
        loop {
            let outcome = tokio::select! {
                _ = self.token.cancelled() => return,
                outcome = async {
                    tokio::time::sleep(interval).await;
                    within(interval, channel.probe()).await
                } => outcome,
            };

            match outcome {
                Ok(()) => {
                    self.misses.store(0, Ordering::Release);
                    self.status.send_modify(|s| {
                        s.last_heartbeat = Some(Utc::now());
                        s.missed_heartbeats = 0;
                    });
                },
                Err(e) if e.is_fatal_transport() => {
                    self.fail(e.to_string()).await;
                    return;
                },
                Err(e) => {
                    tracing::debug!(etl = %self.spec.name(), node = %self.node, error = %e, "Missed heartbeat");
                    if self.record_miss() {
                        self.fail(format!("{} consecutive missed heartbeats", self.config.max_missed_heartbeats))
                            .await;
                        return;
                    }
                },
            }
        }
    }

    /// Count a miss. Returns whether the pod ran out of misses.
    fn record_miss(&self) -> bool {
        let misses = self.misses.fetch_add(1, Ordering::AcqRel) + 1;
        self.status.send_modify(|s| s.missed_heartbeats = misses);
        misses >= self.config.max_missed_heartbeats
    }

    /// Count a timed out transfer. Heartbeats answered in between do not
    /// reset this count.
    fn record_timeout(&self) -> bool {
        let timeouts = self.timeouts.fetch_add(1, Ordering::AcqRel) + 1;
        self.status.send_modify(|s| s.consecutive_timeouts = timeouts);
        timeouts >= self.config.max_missed_heartbeats
    }

    /// Transform one object on this pod.
    ///
    /// Consecutive transfer timeouts count like missed heartbeats; a fatal
    /// transport error fails the pod. Once the pod has released its channel
    /// every call fails with [`TransportError::Closed`].
    pub async fn transform(&self, data: Bytes) -> Result<Bytes> {
        let channel = {
            let inner = self.inner.lock().await;
            match (&inner.stage, &inner.channel) {
                (PodStage::Running, Some(channel)) => channel.clone(),
                (PodStage::Initializing, _) => {
                    return Err(LifecycleError::NotRunning(self.spec.name().to_string()).into())
                },
                _ => return Err(TransportError::Closed.into()),
            }
        };

        match channel.transform(data, self.spec.call_timeout()).await {
            Ok(out) => {
                self.misses.store(0, Ordering::Release);
                self.timeouts.store(0, Ordering::Release);
                self.status.send_modify(|s| {
                    s.missed_heartbeats = 0;
                    s.consecutive_timeouts = 0;
                });
                Ok(out)
            },
            Err(e) if e.is_timeout() => {
                if self.record_timeout() {
                    self.fail(format!(
                        "{} consecutive transfers timed out",
                        self.config.max_missed_heartbeats
                    ))
                    .await;
                }
                Err(e)
            },
            Err(e) if e.is_fatal_transport() => {
                self.fail(e.to_string()).await;
                Err(e)
            },
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    async fn fail(&self, reason: String) {
        let channel = {
            let mut inner = self.inner.lock().await;
            if !self.transition(&mut inner, PodStage::Failed(reason.clone())) {
                return;
            }
            inner.channel.take()
        };
        tracing::warn!(etl = %self.spec.name(), node = %self.node, %reason, "Pod failed");
        self.token.cancel();
        if let Some(channel) = channel {
            let _ = channel.close().await;
        }
    }

    /// Stop the pod and release its process and channel.
    ///
    /// Stopping a pod that already reached a terminal stage is a no-op.
    pub async fn stop(&self) {
        let (channel, tasks) = {
            let mut inner = self.inner.lock().await;
            if !self.transition(&mut inner, PodStage::Stopped) {
                return;
            }
            (inner.channel.take(), std::mem::take(&mut inner.tasks))
        };

        self.token.cancel();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                tracing::debug!(node = %self.node, error = %e, "Closing channel failed");
            }
        }

        let deadline = self.config.stop_grace + Duration::from_secs(1);
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(deadline, task).await.is_err() {
                tracing::warn!(etl = %self.spec.name(), node = %self.node, "Pod task did not exit, aborting");
                abort.abort();
            }
        }
        tracing::info!(etl = %self.spec.name(), node = %self.node, "Pod stopped");
    }
}

impl Drop for Pod {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

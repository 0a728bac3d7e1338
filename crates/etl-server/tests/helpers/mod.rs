//! Test helpers for ETL server integration tests
//!
//! This module provides utilities for:
//! - A scripted in-process transformer
//! - Clusters of native pods behind a real HTTP listener
//! - Waiting on pod stages

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use etl_common::types::{NodeId, PodStage};
use etl_server::{
    api::{create_router, AppState},
    config::Config,
    etl::{runtime::NativeRuntime, webserver::Transformer, Cluster, Pod, PodConfig, RawEtlSpec},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

/// Serialized-callable placeholder accepted by the packager.
pub const TEST_CODE: &str = "gASVAAAA";

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(10);

/// Uppercases its input with a few scripted behaviours:
///
/// - `sleep:<ms>:<rest>` sleeps, then uppercases `<rest>`
/// - `fail` is rejected with `boom`
pub struct Scripted;

#[async_trait]
impl Transformer for Scripted {
    async fn transform(&self, input: Bytes) -> Result<Bytes, String> {
        if input.as_ref() == b"fail" {
            return Err("boom".to_string());
        }
        let text = String::from_utf8_lossy(&input).into_owned();
        let rest = match text.strip_prefix("sleep:").and_then(|s| s.split_once(':')) {
            Some((ms, rest)) => {
                let ms: u64 = ms.parse().map_err(|_| format!("bad delay '{}'", ms))?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                rest.to_string()
            },
            None => text,
        };
        Ok(Bytes::from(rest.to_ascii_uppercase()))
    }
}

pub fn scripted() -> NativeRuntime {
    NativeRuntime::new(Arc::new(Scripted))
}

/// Pod timings short enough for tests.
pub fn fast_config() -> PodConfig {
    PodConfig {
        heartbeat_interval: Duration::from_millis(50),
        max_missed_heartbeats: 3,
        probe_interval: Duration::from_millis(10),
        stop_grace: Duration::from_millis(500),
    }
}

pub fn raw_spec(name: &str, comm: &str) -> RawEtlSpec {
    RawEtlSpec::new(name, TEST_CODE)
        .with_comm(comm)
        .with_timeout("5s")
}

/// A cluster of native pods whose control API listens on a local port, so
/// pull-mode pods can call back into it.
pub struct TestCluster {
    pub cluster: Arc<Cluster>,
    pub runtime: Arc<NativeRuntime>,
    pub url: Url,
    server: JoinHandle<()>,
}

impl TestCluster {
    pub async fn start(nodes: &[&str], runtime: NativeRuntime) -> Self {
        Self::with_config(nodes, runtime, fast_config()).await
    }

    pub async fn with_config(nodes: &[&str], runtime: NativeRuntime, config: PodConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();

        let runtime = Arc::new(runtime);
        let cluster = Arc::new(Cluster::new(
            nodes.iter().map(|n| NodeId::new(*n)),
            runtime.clone(),
            url.clone(),
            config,
        ));

        let app = create_router(
            AppState {
                cluster: cluster.clone(),
            },
            &Config::default(),
        );
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            cluster,
            runtime,
            url,
            server,
        }
    }

    pub async fn pod(&self, name: &str, node: &str) -> Arc<Pod> {
        self.cluster
            .pod(name, &NodeId::new(node))
            .await
            .unwrap_or_else(|| panic!("no pod for {} on {}", name, node))
    }

    /// Wait until the pod of `name` on `node` has left `Initializing`.
    pub async fn settled(&self, name: &str, node: &str) -> PodStage {
        let pod = self.pod(name, node).await;
        tokio::time::timeout(WAIT, pod.wait_settled())
            .await
            .expect("pod did not settle")
    }

    pub async fn transform(&self, name: &str, node: &str, data: &'static [u8]) -> etl_common::error::Result<Bytes> {
        self.cluster
            .transform(name, &NodeId::new(node), Bytes::from_static(data))
            .await
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Wait until `pod` reaches a terminal stage.
pub async fn terminal(pod: &Pod) -> PodStage {
    tokio::time::timeout(WAIT, pod.wait_for_stage(|s| s.is_terminal()))
        .await
        .expect("pod did not reach a terminal stage")
}

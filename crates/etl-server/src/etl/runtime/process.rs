//! One OS process per pod
//!
//! The launcher binary receives everything it needs through its environment:
//!
//! | Variable           | Value                                          |
//! |--------------------|------------------------------------------------|
//! | `ETL_NAME`         | ETL name                                       |
//! | `ETL_COMM_TYPE`    | `hpush`, `hpull`, `ws` or `io`                 |
//! | `ETL_RUNTIME`      | runtime identifier, e.g. `python3.13v2`        |
//! | `ETL_CODE`         | base64 of the rendered code unit               |
//! | `ETL_DEPENDENCIES` | base64 of the newline separated package list   |
//! | `ETL_ARG_TYPE`     | `""` or `url`                                  |
//! | `ETL_CHUNK_SIZE`   | streaming chunk size, `0` when unset           |
//! | `ETL_PORT`         | port to listen on (network modes)              |
//! | `AIS_TARGET_URL`   | node URL for pull callbacks                    |
//! | `ETL_NODE_ID`      | node hosting the pod                           |
//!
//! A spec's `runtime_spec` replaces the launcher command and arguments and adds
//! its own variables; the ones above always win.

use async_trait::async_trait;
use etl_common::error::{Result, TransportError};
use etl_common::types::{CommMode, NodeId};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use url::Url;

use super::{LaunchedPod, PodProcess, PodRuntime};
use crate::etl::spec::EtlSpec;
use crate::etl::transport::PodEndpoint;

/// Spawns the pod launcher as a child process.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    command: String,
    args: Vec<String>,
    node_url: Url,
}

impl ProcessRuntime {
    pub fn new(command: impl Into<String>, args: Vec<String>, node_url: Url) -> Self {
        Self {
            command: command.into(),
            args,
            node_url,
        }
    }

    fn environment(&self, spec: &EtlSpec, node: &NodeId, port: u16) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = spec
            .runtime_spec()
            .map(|r| r.env.clone().into_iter().collect())
            .unwrap_or_default();
        env.insert("ETL_NAME".to_string(), spec.name().to_string());
        env.insert("ETL_COMM_TYPE".to_string(), spec.comm().as_str().to_string());
        env.insert("ETL_RUNTIME".to_string(), spec.runtime().identifier());
        env.insert("ETL_CODE".to_string(), spec.artifact().encoded());
        env.insert("ETL_DEPENDENCIES".to_string(), spec.encoded_dependencies());
        env.insert("ETL_ARG_TYPE".to_string(), spec.arg_type().as_str().to_string());
        env.insert(
            "ETL_CHUNK_SIZE".to_string(),
            spec.chunk_size().unwrap_or(0).to_string(),
        );
        env.insert("ETL_PORT".to_string(), port.to_string());
        env.insert("AIS_TARGET_URL".to_string(), self.node_url.to_string());
        env.insert("ETL_NODE_ID".to_string(), node.to_string());
        env
    }
}

/// Ask the OS for a port nobody is listening on.
fn free_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

#[async_trait]
impl PodRuntime for ProcessRuntime {
    async fn launch(&self, spec: &EtlSpec, node: &NodeId) -> Result<LaunchedPod> {
        let comm = spec.comm();
        let port = match comm {
            CommMode::Pipe => 0,
            _ => free_port()?,
        };
        let stdio = || match comm {
            CommMode::Pipe => Stdio::piped(),
            _ => Stdio::null(),
        };

        let (command, args) = match spec.runtime_spec() {
            Some(launch) => (&launch.command, &launch.args),
            None => (&self.command, &self.args),
        };

        let mut child = Command::new(command)
            .args(args)
            .envs(self.environment(spec, node, port))
            .stdin(stdio())
            .stdout(stdio())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        tracing::info!(
            pid = child.id(),
            command = %command,
            etl = %spec.name(),
            node = %node,
            comm = %comm,
            port,
            "Pod process started"
        );

        let endpoint = match comm {
            CommMode::Push | CommMode::Pull => {
                let url = Url::parse(&format!("http://{}:{}/", Ipv4Addr::LOCALHOST, port))
                    .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
                PodEndpoint::Http(url)
            },
            CommMode::StreamingSocket => {
                PodEndpoint::Socket(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            },
            CommMode::Pipe => {
                let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
                    (Some(stdin), Some(stdout)) => (stdin, stdout),
                    _ => {
                        return Err(
                            TransportError::ProcessExited("pod stdio was not captured".into()).into()
                        )
                    },
                };
                PodEndpoint::pipe(Box::new(stdin), Box::new(stdout))
            },
        };

        Ok(LaunchedPod {
            endpoint,
            process: Box::new(ChildProcess {
                child,
                exited: None,
            }),
        })
    }
}

struct ChildProcess {
    child: Child,
    exited: Option<String>,
}

#[async_trait]
impl PodProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> String {
        if let Some(status) = &self.exited {
            return status.clone();
        }
        let status = match self.child.wait().await {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {}", e),
        };
        self.exited = Some(status.clone());
        status
    }

    async fn terminate(&mut self, grace: Duration) {
        if self.exited.is_some() {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "SIGTERM failed");
            }
            if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
                tracing::debug!(pid, %status, "Pod process exited");
                self.exited = Some(status.to_string());
                return;
            }
            tracing::warn!(pid, ?grace, "Pod ignored SIGTERM, killing");
        }

        #[cfg(not(unix))]
        let _ = grace;

        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "Failed to kill pod process");
        }
        self.exited = Some("killed".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::spec::{RawEtlSpec, RuntimeSpec};
    use std::collections::BTreeMap;

    fn spec(comm: &str) -> EtlSpec {
        EtlSpec::validate(&RawEtlSpec::new("proc-etl", "gASVAAAA").with_comm(comm)).unwrap()
    }

    fn runtime(command: &str, args: &[&str]) -> ProcessRuntime {
        ProcessRuntime::new(
            command,
            args.iter().map(|s| s.to_string()).collect(),
            Url::parse("http://127.0.0.1:8080/").unwrap(),
        )
    }

    #[test]
    fn test_environment_carries_spec() {
        let spec = spec("hpull");
        let env = runtime("etl-pod", &[]).environment(&spec, &NodeId::new("node-1"), 4242);
        assert_eq!(env["ETL_NAME"], "proc-etl");
        assert_eq!(env["ETL_COMM_TYPE"], "hpull");
        assert_eq!(env["ETL_RUNTIME"], "python3.13v2");
        assert_eq!(env["ETL_CODE"], spec.artifact().encoded());
        assert_eq!(env["ETL_PORT"], "4242");
        assert_eq!(env["AIS_TARGET_URL"], "http://127.0.0.1:8080/");
        assert_eq!(env["ETL_NODE_ID"], "node-1");
        assert_eq!(env["ETL_CHUNK_SIZE"], "0");
    }

    fn with_launch(launch: RuntimeSpec) -> EtlSpec {
        let mut raw = RawEtlSpec::new("proc-etl", "gASVAAAA");
        raw.runtime_spec = Some(launch);
        EtlSpec::validate(&raw).unwrap()
    }

    #[test]
    fn test_runtime_spec_env_cannot_shadow_pod_variables() {
        let spec = with_launch(RuntimeSpec {
            command: "etl-pod".into(),
            args: vec![],
            env: BTreeMap::from([
                ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
                ("ETL_NAME".to_string(), "spoofed".to_string()),
            ]),
        });
        let env = runtime("etl-pod", &[]).environment(&spec, &NodeId::new("node-1"), 4242);
        assert_eq!(env["PYTHONUNBUFFERED"], "1");
        assert_eq!(env["ETL_NAME"], "proc-etl");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runtime_spec_overrides_launcher() {
        let spec = with_launch(RuntimeSpec {
            command: "sh".into(),
            args: vec!["-c".into(), "exit $POD_EXIT".into()],
            env: BTreeMap::from([("POD_EXIT".to_string(), "7".to_string())]),
        });
        let mut pod = runtime("/nonexistent/etl-pod-launcher", &[])
            .launch(&spec, &NodeId::new("node-1"))
            .await
            .unwrap();
        let status = pod.process.wait().await;
        assert!(status.contains('7'), "{status}");
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_binary() {
        let result = runtime("/nonexistent/etl-pod-launcher", &[])
            .launch(&spec("hpush"), &NodeId::new("node-1"))
            .await;
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_reports_exit_status() {
        let mut pod = runtime("sh", &["-c", "exit 3"])
            .launch(&spec("hpush"), &NodeId::new("node-1"))
            .await
            .unwrap();
        assert!(matches!(pod.endpoint, PodEndpoint::Http(_)));
        let status = pod.process.wait().await;
        assert!(status.contains('3'), "{status}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_process() {
        let mut pod = runtime("sleep", &["30"])
            .launch(&spec("io"), &NodeId::new("node-1"))
            .await
            .unwrap();
        assert!(matches!(pod.endpoint, PodEndpoint::Pipe(Some(_))));
        assert!(pod.process.id().is_some());

        pod.process.terminate(Duration::from_secs(5)).await;
        let status = pod.process.wait().await;
        assert!(!status.is_empty());
    }
}

//! Configuration management

use etl_common::duration::parse_duration;
use etl_common::types::NodeId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::etl::lifecycle::{
    PodConfig, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_MISSED_HEARTBEATS, DEFAULT_PROBE_INTERVAL,
    DEFAULT_STOP_GRACE,
};

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8000;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default node list: a single local node.
pub const DEFAULT_NODE_IDS: &str = "node-1";

/// Default pod launcher binary.
pub const DEFAULT_POD_COMMAND: &str = "etl-pod";

/// Default CORS allowed origin for local development.
pub const DEFAULT_CORS_ALLOWED_ORIGIN: &str = "http://localhost:3000";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub cluster: ClusterConfig,
    pub cors: CorsConfig,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
    /// URL pods use to reach this server; derived from host and port when unset
    pub public_url: Option<String>,
}

/// Pod orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub node_ids: Vec<String>,
    #[serde(with = "duration_str")]
    pub heartbeat_interval: Duration,
    pub heartbeat_misses: u32,
    #[serde(with = "duration_str")]
    pub probe_interval: Duration,
    #[serde(with = "duration_str")]
    pub stop_grace: Duration,
    pub pod_command: String,
    pub pod_args: Vec<String>,
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

fn env_duration(key: &str, default: Duration) -> anyhow::Result<Duration> {
    match std::env::var(key) {
        Ok(value) => parse_duration(&value).map_err(|e| anyhow::anyhow!("{}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

fn split_list(value: &str, separator: char) -> Vec<String> {
    value
        .split(separator)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            server: ServerConfig {
                host: std::env::var("ETL_HOST").unwrap_or_else(|_| DEFAULT_SERVER_HOST.to_string()),
                port: std::env::var("ETL_PORT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_SERVER_PORT),
                shutdown_timeout_secs: std::env::var("ETL_SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
                public_url: std::env::var("ETL_PUBLIC_URL").ok(),
            },
            cluster: ClusterConfig {
                node_ids: split_list(
                    &std::env::var("ETL_NODE_IDS").unwrap_or_else(|_| DEFAULT_NODE_IDS.to_string()),
                    ',',
                ),
                heartbeat_interval: env_duration("ETL_HEARTBEAT_INTERVAL", DEFAULT_HEARTBEAT_INTERVAL)?,
                heartbeat_misses: std::env::var("ETL_HEARTBEAT_MISSES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_MAX_MISSED_HEARTBEATS),
                probe_interval: env_duration("ETL_PROBE_INTERVAL", DEFAULT_PROBE_INTERVAL)?,
                stop_grace: env_duration("ETL_STOP_GRACE", DEFAULT_STOP_GRACE)?,
                pod_command: std::env::var("ETL_POD_COMMAND")
                    .unwrap_or_else(|_| DEFAULT_POD_COMMAND.to_string()),
                pod_args: std::env::var("ETL_POD_ARGS")
                    .map(|s| split_list(&s, ' '))
                    .unwrap_or_default(),
            },
            cors: CorsConfig {
                allowed_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                    .unwrap_or_else(|_| DEFAULT_CORS_ALLOWED_ORIGIN.to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
                allow_credentials: std::env::var("CORS_ALLOW_CREDENTIALS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(false),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.cluster.node_ids.is_empty() {
            anyhow::bail!("At least one node id is required");
        }

        let mut seen = std::collections::HashSet::new();
        for id in &self.cluster.node_ids {
            if !seen.insert(id) {
                anyhow::bail!("Duplicate node id '{}'", id);
            }
        }

        if self.cluster.heartbeat_misses == 0 {
            anyhow::bail!("Heartbeat misses must be greater than 0");
        }

        if self.cluster.heartbeat_interval.is_zero() {
            anyhow::bail!("Heartbeat interval must be greater than 0");
        }

        if self.cluster.pod_command.is_empty() {
            anyhow::bail!("Pod command cannot be empty");
        }

        self.public_url()?;

        if self.cors.allowed_origins.is_empty() {
            tracing::warn!("No CORS origins configured - all origins will be allowed");
        }

        Ok(())
    }

    /// Address the control surface listens on.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Base URL pods use for pull callbacks.
    pub fn public_url(&self) -> anyhow::Result<Url> {
        let raw = match &self.server.public_url {
            Some(url) => url.clone(),
            None => format!("http://{}/", self.bind_addr()),
        };
        let mut url = Url::parse(&raw).map_err(|e| anyhow::anyhow!("Invalid public URL '{}': {}", raw, e))?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.cluster.node_ids.iter().map(|id| NodeId::new(id.as_str())).collect()
    }

    pub fn pod_config(&self) -> PodConfig {
        PodConfig {
            heartbeat_interval: self.cluster.heartbeat_interval,
            max_missed_heartbeats: self.cluster.heartbeat_misses,
            probe_interval: self.cluster.probe_interval,
            stop_grace: self.cluster.stop_grace,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                public_url: None,
            },
            cluster: ClusterConfig {
                node_ids: vec![DEFAULT_NODE_IDS.to_string()],
                heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
                heartbeat_misses: DEFAULT_MAX_MISSED_HEARTBEATS,
                probe_interval: DEFAULT_PROBE_INTERVAL,
                stop_grace: DEFAULT_STOP_GRACE,
                pod_command: DEFAULT_POD_COMMAND.to_string(),
                pod_args: Vec::new(),
            },
            cors: CorsConfig {
                allowed_origins: vec![DEFAULT_CORS_ALLOWED_ORIGIN.to_string()],
                allow_credentials: false,
            },
        }
    }
}

mod duration_str {
    use etl_common::duration::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 8] = [
        "ETL_PORT",
        "ETL_NODE_IDS",
        "ETL_HEARTBEAT_INTERVAL",
        "ETL_HEARTBEAT_MISSES",
        "ETL_POD_ARGS",
        "ETL_PUBLIC_URL",
        "ETL_STOP_GRACE",
        "ETL_PROBE_INTERVAL",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.public_url().unwrap().as_str(), "http://127.0.0.1:8000/");
    }

    #[test]
    #[serial]
    fn test_load_from_env() {
        clear_env();
        std::env::set_var("ETL_PORT", "9100");
        std::env::set_var("ETL_NODE_IDS", "node-a, node-b,node-c");
        std::env::set_var("ETL_HEARTBEAT_INTERVAL", "2s");
        std::env::set_var("ETL_POD_ARGS", "--verbose  --runtime=native");
        std::env::set_var("ETL_PUBLIC_URL", "http://storage.local:9100/etl");

        let config = Config::load().unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.cluster.node_ids, vec!["node-a", "node-b", "node-c"]);
        assert_eq!(config.cluster.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.cluster.pod_args, vec!["--verbose", "--runtime=native"]);
        assert_eq!(config.public_url().unwrap().as_str(), "http://storage.local:9100/etl/");
        assert_eq!(config.pod_config().max_missed_heartbeats, DEFAULT_MAX_MISSED_HEARTBEATS);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_duration_is_rejected() {
        clear_env();
        std::env::set_var("ETL_HEARTBEAT_INTERVAL", "soon");
        assert!(Config::load().is_err());
        clear_env();
    }

    #[test]
    fn test_validate_rejects_bad_cluster() {
        let mut config = Config::default();
        config.cluster.node_ids = vec!["n1".into(), "n1".into()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cluster.node_ids.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cluster.heartbeat_misses = 0;
        assert!(config.validate().is_err());
    }
}

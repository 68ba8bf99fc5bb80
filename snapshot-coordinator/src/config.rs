//! Configuration management for the snapshot coordinator.
//!
//! Loads configuration from a TOML file with environment variable
//! overrides (`SNAPSHOT_COORDINATOR__STORE__BUCKET=...`).

use crate::store::RetryPolicy;
use crate::utils::errors::CoordinatorError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "SNAPSHOT_COORDINATOR";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    pub ensemble: EnsembleConfig,
    #[serde(default)]
    pub leadership: LeadershipConfig,
    /// Node id → base URL of that node's operator API. Used to confirm a
    /// lease holder is gone before its expired lease is reclaimed.
    #[serde(default)]
    pub peers: HashMap<String, String>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier, recorded as lease holder
    pub id: String,

    /// Operator API port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// How long `serve` waits for running operations after SIGTERM
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub bucket: String,

    /// Custom endpoint for non-AWS S3-compatible stores
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_region")]
    pub region: String,

    /// Key prefix under which all records live
    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default)]
    pub allow_http: bool,

    /// Static credentials. When unset the environment's credential chain is used.
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_lease_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Base URL of the supervisor sidecar exposing the control surface
    pub admin_url: String,

    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    #[serde(default = "default_replace_timeout_secs")]
    pub replace_timeout_secs: u64,

    #[serde(default = "default_verify_timeout_secs")]
    pub verify_timeout_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadershipConfig {
    /// Static election result for this node
    #[serde(default)]
    pub leader: bool,

    /// File maintained by the external election; this node leads while the
    /// file holds its node id. Takes precedence over `leader`.
    #[serde(default)]
    pub leader_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lease_ttl_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_listen_port() -> u16 {
    9990
}

fn default_shutdown_grace_secs() -> u64 {
    60
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_prefix() -> String {
    "snapshots".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_lease_ttl_secs() -> u64 {
    300
}

fn default_drain_timeout_secs() -> u64 {
    120
}

fn default_replace_timeout_secs() -> u64 {
    600
}

fn default_verify_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Build configuration from defaults, an optional TOML file, and the
    /// environment, in increasing precedence.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.node.id.trim().is_empty() {
            return Err(CoordinatorError::Config("node.id must not be empty".into()));
        }
        if self.store.bucket.trim().is_empty() {
            return Err(CoordinatorError::Config("store.bucket must be set".into()));
        }
        if self.store.access_key_id.is_some() != self.store.secret_access_key.is_some() {
            return Err(CoordinatorError::Config(
                "store.access_key_id and store.secret_access_key must be set together".into(),
            ));
        }
        if self.lease.ttl_secs == 0 {
            return Err(CoordinatorError::Config("lease.ttl_secs must be positive".into()));
        }
        if self.ensemble.admin_url.trim().is_empty() {
            return Err(CoordinatorError::Config("ensemble.admin_url must be set".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            request_timeout: Duration::from_secs(self.store.request_timeout_secs),
            max_retries: self.store.max_retries,
            initial_backoff: Duration::from_millis(self.store.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.store.max_backoff_ms),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node: NodeConfig {
                id: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "snapshot-coordinator-0".to_string()),
                listen_port: default_listen_port(),
                shutdown_grace_secs: default_shutdown_grace_secs(),
            },
            store: StoreConfig {
                bucket: String::new(),
                endpoint: None,
                region: default_region(),
                prefix: default_prefix(),
                allow_http: false,
                access_key_id: None,
                secret_access_key: None,
                request_timeout_secs: default_request_timeout_secs(),
                max_retries: default_max_retries(),
                initial_backoff_ms: default_initial_backoff_ms(),
                max_backoff_ms: default_max_backoff_ms(),
            },
            lease: LeaseConfig::default(),
            ensemble: EnsembleConfig {
                admin_url: "http://127.0.0.1:8081".to_string(),
                drain_timeout_secs: default_drain_timeout_secs(),
                replace_timeout_secs: default_replace_timeout_secs(),
                verify_timeout_secs: default_verify_timeout_secs(),
                poll_interval_ms: default_poll_interval_ms(),
            },
            leadership: LeadershipConfig::default(),
            peers: HashMap::new(),
            log: LogConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_file() -> anyhow::Result<()> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        writeln!(
            file,
            r#"
[node]
id = "zk-1"

[store]
bucket = "ensemble-backups"
endpoint = "http://minio:9000"
allow_http = true
prefix = "prod/zk"

[ensemble]
admin_url = "http://localhost:8081"
drain_timeout_secs = 30

[leadership]
leader = true

[peers]
zk-0 = "http://zk-0:9990"
"#
        )?;

        let config = Config::load(Some(file.path()))?;
        assert_eq!(config.node.id, "zk-1");
        assert_eq!(config.node.listen_port, 9990);
        assert_eq!(config.store.bucket, "ensemble-backups");
        assert_eq!(config.store.prefix, "prod/zk");
        assert_eq!(config.store.region, "us-east-1");
        assert_eq!(config.ensemble.drain_timeout_secs, 30);
        assert_eq!(config.ensemble.verify_timeout_secs, 300);
        assert_eq!(config.lease.ttl_secs, 300);
        assert!(config.leadership.leader);
        assert_eq!(config.peers.get("zk-0").map(String::as_str), Some("http://zk-0:9990"));
        Ok(())
    }

    #[test]
    fn test_missing_bucket_is_rejected() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, CoordinatorError::Config(_)));
    }

    #[test]
    fn test_half_credentials_are_rejected() {
        let mut config = Config::default();
        config.store.bucket = "b".into();
        config.store.access_key_id = Some("AKIA".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_policy() {
        let mut config = Config::default();
        config.store.max_retries = 2;
        config.store.initial_backoff_ms = 50;
        let policy = config.retry_policy();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.initial_backoff, Duration::from_millis(50));
        assert_eq!(policy.request_timeout, Duration::from_secs(30));
    }
}

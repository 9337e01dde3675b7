//! Configuration types for gpuledger

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "GPULEDGER";

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Admission API configuration
    pub api: ApiConfig,
    /// Ledger store configuration
    pub store: StoreConfig,
    /// Cluster control plane configuration
    pub cluster: ClusterConfig,
    /// Hardware probe configuration
    pub probe: ProbeConfig,
    /// Node registrar configuration
    pub registrar: RegistrarConfig,
    /// Allocation coordinator configuration
    pub allocator: AllocatorConfig,
    /// Lifecycle reconciler configuration
    pub reconciler: ReconcilerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from an optional file, then `GPULEDGER__*` environment overrides.
    ///
    /// Nested keys use `__` as separator, e.g. `GPULEDGER__STORE__DATABASE_URL`.
    pub fn load(path: Option<&Path>) -> Result<Self, crate::LedgerError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?.try_deserialize()?;
        Ok(config)
    }
}

/// Admission API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the HTTP server
    pub address: String,
    /// Port for the HTTP server
    pub port: u16,
    /// Upper bound for a single admission request
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 31000,
            request_timeout_secs: 30,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Ledger store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local ledger, lost on restart
    Memory,
    /// PostgreSQL-backed ledger
    Postgres,
}

/// Ledger store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Connection URL for the postgres backend
    pub database_url: String,
    /// Maximum pooled connections
    pub max_connections: u32,
    /// Connection acquire timeout in seconds
    pub acquire_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_url: "postgres://localhost/gpuledger".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 5,
        }
    }
}

/// Cluster control plane backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterBackend {
    /// In-process control plane, for development
    Memory,
    /// Kubernetes API server
    Kubernetes,
}

/// Cluster control plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub backend: ClusterBackend,
    /// API server base URL
    pub api_server: String,
    /// Bearer token file
    pub token_path: Option<PathBuf>,
    /// CA bundle used to verify the API server
    pub ca_cert_path: Option<PathBuf>,
    /// Namespace workloads and credential secrets live in
    pub namespace: String,
    /// Label selector identifying managed workloads
    pub workload_selector: String,
    /// Label key marking GPU-capable nodes
    pub gpu_node_label: String,
    /// Label value marking GPU-capable nodes
    pub gpu_node_label_value: String,
    /// Interval between watch polls in seconds
    pub poll_interval_secs: u64,
    /// Image pull secret attached to workloads
    pub image_pull_secret: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            backend: ClusterBackend::Kubernetes,
            api_server: "https://kubernetes.default.svc".to_string(),
            token_path: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/token",
            )),
            ca_cert_path: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt",
            )),
            namespace: "xrcloud".to_string(),
            workload_selector: "app=gpushare".to_string(),
            gpu_node_label: "gpushare".to_string(),
            gpu_node_label_value: "true".to_string(),
            poll_interval_secs: 30,
            image_pull_secret: Some("regcred".to_string()),
        }
    }
}

impl ClusterConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Hardware probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Remote user for probe commands
    pub ssh_user: String,
    /// Timeout for each remote command in seconds
    pub timeout_secs: u64,
    /// Attempts per probe before giving up
    pub max_attempts: u32,
    /// Delay between attempts in seconds
    pub retry_delay_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ssh_user: "root".to_string(),
            timeout_secs: 30,
            max_attempts: 3,
            retry_delay_secs: 5,
        }
    }
}

/// Node registrar configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    /// Credential secret name is `<node><suffix>`
    pub credential_secret_suffix: String,
    /// Key holding the credential inside the secret
    pub credential_key: String,
    /// Interval between credential lookups in seconds
    pub credential_poll_interval_secs: u64,
    /// Give up waiting for a credential after this many seconds
    pub credential_timeout_secs: u64,
    /// Interval between node rescans in seconds; 0 disables them
    pub rescan_interval_secs: u64,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            credential_secret_suffix: "-root-password".to_string(),
            credential_key: "password".to_string(),
            credential_poll_interval_secs: 10,
            credential_timeout_secs: 300,
            rescan_interval_secs: 60,
        }
    }
}

/// Allocation coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Maximum reserve attempts per allocation
    pub max_attempts: u32,
    /// First backoff after a lost race, in milliseconds
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_backoff_ms: u64,
    /// Total time budget per allocation in milliseconds
    pub budget_ms: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff_ms: 20,
            max_backoff_ms: 500,
            budget_ms: 5000,
        }
    }
}

/// Lifecycle reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Reclaim VRAM of failed workloads as well as succeeded ones
    pub reclaim_on_failure: bool,
    /// Interval of the periodic workload sweep in seconds (0 disables it)
    pub resync_interval_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reclaim_on_failure: true,
            resync_interval_secs: 60,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.api.port, 31000);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.cluster.namespace, "xrcloud");
        assert_eq!(config.registrar.credential_timeout_secs, 300);
        assert_eq!(config.registrar.rescan_interval_secs, 60);
        assert!(config.reconciler.reclaim_on_failure);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[api]
port = 32000

[store]
backend = "postgres"
database_url = "postgres://db/ledger"

[cluster]
backend = "memory"
namespace = "gpu-jobs"

[allocator]
max_attempts = 3
"#
        )
        .unwrap();

        let config = DaemonConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.api.port, 32000);
        assert_eq!(config.api.address, "0.0.0.0");
        assert_eq!(config.store.backend, StoreBackend::Postgres);
        assert_eq!(config.store.database_url, "postgres://db/ledger");
        assert_eq!(config.cluster.backend, ClusterBackend::Memory);
        assert_eq!(config.cluster.namespace, "gpu-jobs");
        assert_eq!(config.allocator.max_attempts, 3);
        assert_eq!(config.allocator.budget_ms, 5000);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = DaemonConfig::load(Some(Path::new("/nonexistent/gpuledger.toml")));
        assert!(matches!(result, Err(crate::LedgerError::Config(_))));
    }
}

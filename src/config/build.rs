//! Image build configuration and metrics backend configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Image build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Registry that built images are pushed to (e.g., "docker.io/myorg")
    #[serde(default = "default_registry")]
    pub registry: String,

    /// Namespace the build Jobs run in
    #[serde(default = "default_build_namespace")]
    pub namespace: String,

    /// Executor image of the build Job
    #[serde(default = "default_kaniko_image")]
    pub kaniko_image: String,

    /// Service account the build Jobs run as
    #[serde(default = "default_service_account")]
    pub service_account: String,

    /// Secret holding a docker `config.json` with push credentials, mounted
    /// into the build container when set
    #[serde(default)]
    pub registry_secret: Option<String>,

    /// Give up on a build after this many seconds
    #[serde(default = "default_build_timeout_secs")]
    pub timeout_secs: u64,

    /// Interval between build Job status checks
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_registry() -> String {
    "docker.io/marshal".to_string()
}

fn default_build_namespace() -> String {
    "marshal-build-bot".to_string()
}

fn default_kaniko_image() -> String {
    "gcr.io/kaniko-project/executor:latest".to_string()
}

fn default_service_account() -> String {
    "build-bot".to_string()
}

fn default_build_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            namespace: default_build_namespace(),
            kaniko_image: default_kaniko_image(),
            service_account: default_service_account(),
            registry_secret: None,
            timeout_secs: default_build_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl BuildConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Image reference a service version is pushed to
    pub fn image_for(&self, short_name: &str, version: &str) -> String {
        format!(
            "{}/{}:{}",
            self.registry.trim_end_matches('/'),
            short_name,
            version
        )
    }
}

/// Metrics backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Instant query endpoint of Prometheus
    #[serde(default = "default_prometheus_url")]
    pub prometheus_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_metrics_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_prometheus_url() -> String {
    "http://prometheus.monitoring:9090/api/v1/query".to_string()
}

fn default_metrics_timeout_secs() -> u64 {
    10
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus_url: default_prometheus_url(),
            timeout_secs: default_metrics_timeout_secs(),
        }
    }
}

/// Background job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Finished jobs are purged after this many seconds
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

fn default_retention_secs() -> u64 {
    3600
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
        }
    }
}

impl JobsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

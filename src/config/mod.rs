//! # Control Plane Configuration
//!
//! One YAML file with four sections, every field optional:
//!
//! ```yaml
//! kubernetes:
//!   namespace: apps
//!   service_type: ClusterIP
//! build:
//!   registry: ghcr.io/myorg
//!   timeout_secs: 900
//! metrics:
//!   prometheus_url: http://prometheus:9090/api/v1/query
//! jobs:
//!   retention_secs: 7200
//! ```
//!
//! A missing file means defaults. `MARSHAL_NAMESPACE`, `MARSHAL_REGISTRY`
//! and `PROMETHEUS_URL` override the file.

mod build;
mod kubernetes;

pub use build::{BuildConfig, JobsConfig, MetricsConfig};
pub use kubernetes::KubernetesConfig;

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::error::ConfigError;

/// Complete control plane configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControlPlaneConfig {
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub jobs: JobsConfig,
}

impl ControlPlaneConfig {
    /// Load from an optional file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                debug!("Loading config from {}", path.display());
                let content =
                    std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    })?;
                Self::from_yaml(&content)?
            }
            Some(path) => {
                debug!("Config {} not found, using defaults", path.display());
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    /// Apply overrides from a key lookup (normally the process environment)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(namespace) = lookup("MARSHAL_NAMESPACE") {
            self.kubernetes.namespace = namespace;
        }
        if let Some(registry) = lookup("MARSHAL_REGISTRY") {
            self.build.registry = registry;
        }
        if let Some(url) = lookup("PROMETHEUS_URL") {
            self.metrics.prometheus_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kubernetes.namespace.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "kubernetes.namespace".to_string(),
                value: self.kubernetes.namespace.clone(),
            });
        }
        if self.build.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "build.poll_interval_secs".to_string(),
                value: "0".to_string(),
            });
        }
        if !self.metrics.prometheus_url.starts_with("http://")
            && !self.metrics.prometheus_url.starts_with("https://")
        {
            return Err(ConfigError::InvalidValue {
                field: "metrics.prometheus_url".to_string(),
                value: self.metrics.prometheus_url.clone(),
            });
        }
        Ok(())
    }
}

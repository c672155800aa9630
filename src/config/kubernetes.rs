//! Kubernetes configuration for namespaces, labels, and generated resources.

use serde::{Deserialize, Serialize};

/// Kubernetes configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// Namespace that holds every deployed service instance
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Label carrying the service short name (default: "app")
    #[serde(default = "default_app_label_key")]
    pub app_label_key: String,

    /// Label carrying the service version (default: "version")
    #[serde(default = "default_version_label_key")]
    pub version_label_key: String,

    /// Label carrying the instance id, the dedup key (default: "run")
    #[serde(default = "default_run_label_key")]
    pub run_label_key: String,

    /// Label carrying the interface name on Services (default: "interface")
    #[serde(default = "default_interface_label_key")]
    pub interface_label_key: String,

    /// Type of the Services created for interfaces
    #[serde(default = "default_service_type")]
    pub service_type: String,

    /// Defaults injected into Kafka-enabled services
    #[serde(default)]
    pub kafka: KafkaConfig,
}

fn default_namespace() -> String {
    "marshal-workspace".to_string()
}

fn default_app_label_key() -> String {
    "app".to_string()
}

fn default_version_label_key() -> String {
    "version".to_string()
}

fn default_run_label_key() -> String {
    "run".to_string()
}

fn default_interface_label_key() -> String {
    "interface".to_string()
}

fn default_service_type() -> String {
    "LoadBalancer".to_string()
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            app_label_key: default_app_label_key(),
            version_label_key: default_version_label_key(),
            run_label_key: default_run_label_key(),
            interface_label_key: default_interface_label_key(),
            service_type: default_service_type(),
            kafka: KafkaConfig::default(),
        }
    }
}

/// Kafka connection defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Bootstrap servers (e.g., "bootstrap.kafka:9092")
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,

    /// Consumer group id
    #[serde(default = "default_group_id")]
    pub group_id: String,
}

fn default_bootstrap_servers() -> String {
    "bootstrap.kafka:9092".to_string()
}

fn default_group_id() -> String {
    "marshal".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            group_id: default_group_id(),
        }
    }
}

impl KafkaConfig {
    /// Environment variables set on every Kafka-enabled container
    pub fn environment(&self) -> Vec<(String, String)> {
        vec![
            (
                "KAFKA_BOOTSTRAP_SERVERS".to_string(),
                self.bootstrap_servers.clone(),
            ),
            ("KAFKA_GROUP_ID".to_string(), self.group_id.clone()),
        ]
    }
}

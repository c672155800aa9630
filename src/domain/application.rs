//! Application domain types
//!
//! An application bundles service references, each with exactly one desired
//! deployment record. The record's instance id joins desired state to the
//! Kubernetes resources created for it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::service::ServiceRef;

/// Environment variable names set for Kafka-enabled services
pub const KAFKA_TOPIC_INPUT: &str = "KAFKA_TOPIC_INPUT";
pub const KAFKA_TOPIC_OUTPUT: &str = "KAFKA_TOPIC_OUTPUT";

/// When the kubelet pulls the container image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ImagePullPolicy {
    #[default]
    Always,
    Never,
    IfNotPresent,
}

impl ImagePullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::Never => "Never",
            Self::IfNotPresent => "IfNotPresent",
        }
    }
}

/// Restart policy for all containers of a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::OnFailure => "OnFailure",
            Self::Never => "Never",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl EnvironmentVariable {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TopicRoleKind {
    Input,
    Output,
    DeadLetter,
}

/// Kafka topic used by a service instance in a given role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRole {
    pub topic: String,
    pub role: TopicRoleKind,
}

/// Actual-state record written after a successful reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesDeploymentInfo {
    pub namespace: String,
    pub deployment_name: String,
    #[serde(default)]
    pub service_names: Vec<String>,
}

/// Desired deployment of one service within one application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDeploymentInfo {
    pub service: ServiceRef,
    /// Minted once by the state store, never reused
    #[serde(default)]
    pub instance_id: String,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    #[serde(default)]
    pub image_pull_policy: ImagePullPolicy,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub environment_variables: Vec<EnvironmentVariable>,
    #[serde(default)]
    pub topics: Vec<TopicRole>,
    #[serde(default)]
    pub kubernetes_deployment_info: Option<KubernetesDeploymentInfo>,
}

fn default_replicas() -> i32 {
    1
}

impl ServiceDeploymentInfo {
    pub fn new(service: ServiceRef) -> Self {
        Self {
            service,
            instance_id: String::new(),
            replicas: default_replicas(),
            image_pull_policy: ImagePullPolicy::default(),
            restart_policy: RestartPolicy::default(),
            labels: BTreeMap::new(),
            environment_variables: Vec::new(),
            topics: Vec::new(),
            kubernetes_deployment_info: None,
        }
    }

    /// Builder: set instance id
    #[allow(dead_code)]
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Builder: set replicas
    #[allow(dead_code)]
    pub fn with_replicas(mut self, replicas: i32) -> Self {
        self.replicas = replicas;
        self
    }

    /// Builder: add a label
    #[allow(dead_code)]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Builder: add a topic role
    #[allow(dead_code)]
    pub fn with_topic(mut self, topic: impl Into<String>, role: TopicRoleKind) -> Self {
        self.topics.push(TopicRole {
            topic: topic.into(),
            role,
        });
        self
    }

    /// Builder: set the actual-state record
    #[allow(dead_code)]
    pub fn with_kubernetes_info(mut self, info: KubernetesDeploymentInfo) -> Self {
        self.kubernetes_deployment_info = Some(info);
        self
    }

    /// First topic with the given role
    pub fn topic(&self, role: TopicRoleKind) -> Option<&str> {
        self.topics
            .iter()
            .find(|t| t.role == role)
            .map(|t| t.topic.as_str())
    }

    pub fn has_instance_id(&self) -> bool {
        !self.instance_id.is_empty()
    }

    /// Mint an instance id if none has been assigned yet
    pub fn ensure_instance_id(&mut self) -> bool {
        if self.has_instance_id() {
            return false;
        }
        self.instance_id = mint_instance_id(&self.service.short_name);
        true
    }
}

/// Create a fresh instance id for a service
pub fn mint_instance_id(service_short_name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", service_short_name, &suffix[..8])
}

/// Versioned bundle of services with desired deployment configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub short_name: String,
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Ordered service references with their deployment records
    #[serde(default)]
    pub services: Vec<ServiceDeploymentInfo>,
}

impl Application {
    pub fn new(short_name: impl Into<String>, version: impl Into<String>) -> Self {
        let short_name = short_name.into();
        Self {
            name: short_name.clone(),
            short_name,
            version: version.into(),
            description: String::new(),
            services: Vec::new(),
        }
    }

    /// Builder: add a service deployment
    #[allow(dead_code)]
    pub fn with_service(mut self, info: ServiceDeploymentInfo) -> Self {
        self.services.push(info);
        self
    }

    pub fn instance_mut(&mut self, instance_id: &str) -> Option<&mut ServiceDeploymentInfo> {
        self.services
            .iter_mut()
            .find(|s| s.instance_id == instance_id)
    }
}

impl std::fmt::Display for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.short_name, self.version)
    }
}

//! Deployment and health status snapshots
//!
//! The functions here are pure: the status service gathers live
//! observations and folds them with [`fold_deployment_status`] and
//! [`node_metrics`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::service::ServiceRef;

/// Application deployment status value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatusValue {
    Undeployed,
    Deployed,
    Pending,
    Incomplete,
    Unknown,
}

impl std::fmt::Display for DeploymentStatusValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Undeployed => "UNDEPLOYED",
            Self::Deployed => "DEPLOYED",
            Self::Pending => "PENDING",
            Self::Incomplete => "INCOMPLETE",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
}

impl Message {
    pub fn info(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            message_type: MessageType::Info,
        }
    }

    pub fn warning(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            message_type: MessageType::Warning,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            message_type: MessageType::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationDeploymentStatus {
    pub value: DeploymentStatusValue,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl ApplicationDeploymentStatus {
    pub fn new(value: DeploymentStatusValue) -> Self {
        Self {
            value,
            messages: Vec::new(),
        }
    }
}

/// What the cluster reported for one service instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceObservation {
    /// No actual-state record exists
    NotDeployed,
    /// Recorded as deployed but no live Deployment was found
    Missing,
    /// The live lookup failed
    LookupFailed(String),
    Live { available: i32, requested: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceReport {
    pub service: ServiceRef,
    pub instance_id: String,
    pub observation: InstanceObservation,
}

/// Fold per-instance observations into the application's deployment status
pub fn fold_deployment_status(reports: &[InstanceReport]) -> ApplicationDeploymentStatus {
    let failures: Vec<Message> = reports
        .iter()
        .filter_map(|r| match &r.observation {
            InstanceObservation::LookupFailed(reason) => Some(Message::warning(format!(
                "Deployment status of service {} (instance {}) is unknown: {}",
                r.service, r.instance_id, reason
            ))),
            _ => None,
        })
        .collect();
    if !failures.is_empty() {
        return ApplicationDeploymentStatus {
            value: DeploymentStatusValue::Unknown,
            messages: failures,
        };
    }

    let not_deployed = reports
        .iter()
        .filter(|r| r.observation == InstanceObservation::NotDeployed)
        .count();
    if not_deployed == reports.len() {
        return ApplicationDeploymentStatus::new(DeploymentStatusValue::Undeployed);
    }

    let broken: Vec<Message> = reports
        .iter()
        .filter_map(|r| match r.observation {
            InstanceObservation::NotDeployed => Some(Message::error(format!(
                "Service {} (instance {}) is not deployed",
                r.service, r.instance_id
            ))),
            InstanceObservation::Missing => Some(Message::error(format!(
                "Service {} (instance {}) has no running Deployment",
                r.service, r.instance_id
            ))),
            _ => None,
        })
        .collect();
    if !broken.is_empty() {
        return ApplicationDeploymentStatus {
            value: DeploymentStatusValue::Incomplete,
            messages: broken,
        };
    }

    let pending: Vec<Message> = reports
        .iter()
        .filter_map(|r| match r.observation {
            InstanceObservation::Live {
                available,
                requested,
            } if !(requested > 0 && available == requested) => Some(Message::info(format!(
                "Service {} (instance {}) is pending: {}/{} replicas available",
                r.service, r.instance_id, available, requested
            ))),
            _ => None,
        })
        .collect();
    if !pending.is_empty() {
        return ApplicationDeploymentStatus {
            value: DeploymentStatusValue::Pending,
            messages: pending,
        };
    }

    ApplicationDeploymentStatus::new(DeploymentStatusValue::Deployed)
}

/// CPU and memory of one pod; a metric is `None` when its query failed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodMetrics {
    pub memory_usage: Option<f64>,
    pub cpu_load: Option<f64>,
    /// True only if both metrics were retrieved
    pub available: bool,
}

impl PodMetrics {
    pub fn new(memory_usage: Option<f64>, cpu_load: Option<f64>) -> Self {
        Self {
            available: memory_usage.is_some() && cpu_load.is_some(),
            memory_usage,
            cpu_load,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub name: String,
    pub host_ip: Option<String>,
    pub node_name: Option<String>,
    pub phase: String,
    pub restarts: i32,
    pub start_time: Option<DateTime<Utc>>,
    pub age: Option<String>,
    pub metrics: PodMetrics,
}

/// Average load of a service's pods on one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    pub node_name: String,
    pub pod_count: usize,
    pub average_cpu_load: Option<f64>,
    pub average_memory_usage: Option<f64>,
}

/// Group pods by node and average each metric over the pods that reported it
pub fn node_metrics(pods: &[PodInfo]) -> Vec<NodeMetrics> {
    let mut by_node: BTreeMap<&str, Vec<&PodInfo>> = BTreeMap::new();
    for pod in pods {
        let node = pod.node_name.as_deref().unwrap_or("unknown");
        by_node.entry(node).or_default().push(pod);
    }

    by_node
        .into_iter()
        .map(|(node, pods)| NodeMetrics {
            node_name: node.to_string(),
            pod_count: pods.len(),
            average_cpu_load: average(pods.iter().filter_map(|p| p.metrics.cpu_load)),
            average_memory_usage: average(pods.iter().filter_map(|p| p.metrics.memory_usage)),
        })
        .collect()
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Human readable age of a pod, truncated to whole seconds
pub fn pod_age(start_time: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - start_time).num_seconds().max(0) as u64;
    humantime::format_duration(Duration::from_secs(seconds)).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceStatus {
    pub name: String,
    pub external_ips: Vec<String>,
    pub ports: Vec<i32>,
}

/// Live status of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub short_name: String,
    pub version: String,
    pub name: String,
    pub available_replicas: i32,
    pub requested_replicas: i32,
    pub interfaces: Vec<InterfaceStatus>,
    pub pods: Vec<PodInfo>,
    pub nodes: Vec<NodeMetrics>,
    #[serde(default)]
    pub error_messages: Vec<String>,
}

impl ServiceStatus {
    pub fn empty(short_name: &str, version: &str, name: &str) -> Self {
        Self {
            short_name: short_name.to_string(),
            version: version.to_string(),
            name: name.to_string(),
            available_replicas: 0,
            requested_replicas: 0,
            interfaces: Vec::new(),
            pods: Vec::new(),
            nodes: Vec::new(),
            error_messages: Vec::new(),
        }
    }
}

/// Deployment status plus live status of every service of an application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    pub deployment_status: ApplicationDeploymentStatus,
    pub service_statuses: Vec<ServiceStatus>,
    pub total_services: usize,
    pub total_pods: usize,
    pub total_available_replicas: i32,
    pub total_requested_replicas: i32,
}

impl ApplicationStatus {
    pub fn new(
        deployment_status: ApplicationDeploymentStatus,
        service_statuses: Vec<ServiceStatus>,
    ) -> Self {
        Self {
            total_services: service_statuses.len(),
            total_pods: service_statuses.iter().map(|s| s.pods.len()).sum(),
            total_available_replicas: service_statuses.iter().map(|s| s.available_replicas).sum(),
            total_requested_replicas: service_statuses.iter().map(|s| s.requested_replicas).sum(),
            deployment_status,
            service_statuses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, observation: InstanceObservation) -> InstanceReport {
        InstanceReport {
            service: ServiceRef::new(name, "1.0.0"),
            instance_id: format!("{}-1", name),
            observation,
        }
    }

    fn live(available: i32, requested: i32) -> InstanceObservation {
        InstanceObservation::Live {
            available,
            requested,
        }
    }

    fn pod(name: &str, node: &str, cpu: Option<f64>, memory: Option<f64>) -> PodInfo {
        PodInfo {
            name: name.to_string(),
            host_ip: None,
            node_name: Some(node.to_string()),
            phase: "Running".to_string(),
            restarts: 0,
            start_time: None,
            age: None,
            metrics: PodMetrics::new(memory, cpu),
        }
    }

    #[test]
    fn test_nothing_deployed_is_undeployed() {
        let status = fold_deployment_status(&[
            report("cart", InstanceObservation::NotDeployed),
            report("web", InstanceObservation::NotDeployed),
        ]);
        assert_eq!(status.value, DeploymentStatusValue::Undeployed);
        assert!(status.messages.is_empty());
    }

    #[test]
    fn test_partially_deployed_is_incomplete() {
        let status = fold_deployment_status(&[
            report("cart", live(1, 1)),
            report("web", InstanceObservation::NotDeployed),
            report("db", InstanceObservation::NotDeployed),
        ]);
        assert_eq!(status.value, DeploymentStatusValue::Incomplete);
        assert_eq!(status.messages.len(), 2);
        assert!(status
            .messages
            .iter()
            .all(|m| m.message_type == MessageType::Error));
    }

    #[test]
    fn test_recorded_but_gone_is_incomplete() {
        let status = fold_deployment_status(&[
            report("cart", live(2, 2)),
            report("web", InstanceObservation::Missing),
        ]);
        assert_eq!(status.value, DeploymentStatusValue::Incomplete);
        assert!(status.messages[0].content.contains("web"));
    }

    #[test]
    fn test_all_healthy_is_deployed() {
        let status = fold_deployment_status(&[report("cart", live(2, 2)), report("web", live(1, 1))]);
        assert_eq!(status.value, DeploymentStatusValue::Deployed);
    }

    #[test]
    fn test_not_yet_available_is_pending() {
        let status = fold_deployment_status(&[report("cart", live(2, 2)), report("web", live(0, 1))]);
        assert_eq!(status.value, DeploymentStatusValue::Pending);
        assert_eq!(status.messages.len(), 1);
        assert_eq!(status.messages[0].message_type, MessageType::Info);
        assert!(status.messages[0].content.contains("web"));
    }

    #[test]
    fn test_zero_replicas_is_not_healthy() {
        let status = fold_deployment_status(&[report("cart", live(0, 0))]);
        assert_eq!(status.value, DeploymentStatusValue::Pending);
    }

    #[test]
    fn test_lookup_failure_is_unknown() {
        let status = fold_deployment_status(&[
            report("cart", live(1, 1)),
            report("web", InstanceObservation::LookupFailed("timeout".to_string())),
        ]);
        assert_eq!(status.value, DeploymentStatusValue::Unknown);
        assert_eq!(status.messages[0].message_type, MessageType::Warning);
        assert!(status.messages[0].content.contains("timeout"));
    }

    #[test]
    fn test_node_metrics_average_over_reporting_pods() {
        let pods = vec![
            pod("a", "node-1", Some(1.0), Some(100.0)),
            pod("b", "node-1", None, Some(300.0)),
            pod("c", "node-2", Some(0.5), None),
        ];
        let nodes = node_metrics(&pods);
        assert_eq!(nodes.len(), 2);

        assert_eq!(nodes[0].node_name, "node-1");
        assert_eq!(nodes[0].pod_count, 2);
        assert_eq!(nodes[0].average_cpu_load, Some(1.0));
        assert_eq!(nodes[0].average_memory_usage, Some(200.0));

        assert_eq!(nodes[1].node_name, "node-2");
        assert_eq!(nodes[1].average_memory_usage, None);
    }

    #[test]
    fn test_pod_metrics_availability() {
        assert!(PodMetrics::new(Some(1.0), Some(0.1)).available);
        assert!(!PodMetrics::new(Some(1.0), None).available);
    }

    #[test]
    fn test_pod_age() {
        let start = Utc::now();
        let now = start + chrono::Duration::seconds(3725);
        assert_eq!(pod_age(start, now), "1h 2m 5s");
    }

    #[test]
    fn test_application_totals() {
        let mut cart = ServiceStatus::empty("cart", "1.0.0", "Cart");
        cart.available_replicas = 2;
        cart.requested_replicas = 3;
        cart.pods = vec![pod("a", "n", None, None), pod("b", "n", None, None)];
        let web = ServiceStatus::empty("web", "1.0.0", "Web");

        let status = ApplicationStatus::new(
            ApplicationDeploymentStatus::new(DeploymentStatusValue::Pending),
            vec![cart, web],
        );
        assert_eq!(status.total_services, 2);
        assert_eq!(status.total_pods, 2);
        assert_eq!(status.total_available_replicas, 2);
        assert_eq!(status.total_requested_replicas, 3);
    }
}

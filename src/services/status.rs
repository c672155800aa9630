//! Status aggregator
//!
//! Joins desired state, live cluster state and pod metrics into status
//! snapshots. Partial failures end up as messages in the snapshot, never as
//! errors.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::status::{node_metrics, pod_age};
use crate::domain::{
    Application, ApplicationDeploymentStatus, ApplicationStatus, InterfaceStatus, PodInfo,
    PodMetrics, Service, ServiceRef, ServiceStatus,
};
use crate::infrastructure::cluster::{public_ips_of_service, public_ports_of_service};
use crate::infrastructure::metrics::{MetricsBackend, PodMetric};
use crate::infrastructure::store::StateStore;
use crate::services::reconciler::{available_replicas, requested_replicas, Reconciler};

/// Cluster-reported fields of a pod, without metrics
fn pod_info(pod: &Pod, now: DateTime<Utc>) -> PodInfo {
    let status = pod.status.as_ref();
    let start_time = status.and_then(|s| s.start_time.as_ref()).map(|t| t.0);

    PodInfo {
        name: pod
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        host_ip: status.and_then(|s| s.host_ip.clone()),
        node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
        phase: status
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
        restarts: status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|cs| cs.iter().map(|c| c.restart_count).sum())
            .unwrap_or(0),
        start_time,
        age: start_time.map(|start| pod_age(start, now)),
        metrics: PodMetrics::default(),
    }
}

pub struct StatusAggregator {
    reconciler: Arc<Reconciler>,
    metrics: Arc<dyn MetricsBackend>,
    store: Arc<dyn StateStore>,
}

impl StatusAggregator {
    pub fn new(
        reconciler: Arc<Reconciler>,
        metrics: Arc<dyn MetricsBackend>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            reconciler,
            metrics,
            store,
        }
    }

    pub async fn get_application_deployment_status(
        &self,
        application: &Application,
    ) -> ApplicationDeploymentStatus {
        self.reconciler.application_deployment_status(application).await
    }

    /// Query both metrics of a pod concurrently. Each failure only blanks its
    /// own value.
    async fn pod_metrics(&self, pod_name: &str) -> PodMetrics {
        let (memory, cpu) = tokio::join!(
            self.metrics.query_pod_metric(pod_name, PodMetric::MemoryUsage),
            self.metrics.query_pod_metric(pod_name, PodMetric::CpuLoad),
        );

        let memory = memory
            .map_err(|e| debug!("Memory usage of pod {} unavailable: {}", pod_name, e))
            .ok();
        let cpu = cpu
            .map_err(|e| debug!("CPU load of pod {} unavailable: {}", pod_name, e))
            .ok();
        PodMetrics::new(memory, cpu)
    }

    /// Live status of every instance of a service version
    pub async fn get_service_status(&self, service: &Service) -> ServiceStatus {
        let mut status = ServiceStatus::empty(&service.short_name, &service.version, &service.name);
        let reference = service.reference();
        let now = Utc::now();

        match self.reconciler.get_deployments_of_service(&reference).await {
            Ok(deployments) => {
                for deployment in &deployments {
                    status.available_replicas += available_replicas(deployment);
                    status.requested_replicas += requested_replicas(deployment);

                    match self.reconciler.get_pods_of_deployment(deployment).await {
                        Ok(pods) => {
                            for pod in &pods {
                                let mut info = pod_info(pod, now);
                                info.metrics = self.pod_metrics(&info.name).await;
                                status.pods.push(info);
                            }
                        }
                        Err(e) => {
                            warn!("Pods of {} unavailable: {}", reference, e);
                            status.error_messages.push(e.to_string());
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Deployments of {} unavailable: {}", reference, e);
                status.error_messages.push(e.to_string());
            }
        }

        status.pods.sort_by(|a, b| a.name.cmp(&b.name));
        status.nodes = node_metrics(&status.pods);

        for interface in &service.interfaces {
            match self
                .reconciler
                .get_interface_service_of_service(&reference, &interface.name)
                .await
            {
                Ok(k8s_services) => status.interfaces.push(InterfaceStatus {
                    name: interface.name.clone(),
                    external_ips: k8s_services.iter().flat_map(public_ips_of_service).collect(),
                    ports: k8s_services.iter().flat_map(public_ports_of_service).collect(),
                }),
                Err(e) => {
                    warn!("Interface {} of {} unavailable: {}", interface.name, reference, e);
                    status.error_messages.push(e.to_string());
                }
            }
        }

        status
    }

    /// Deployment status plus the live status of each distinct service
    pub async fn get_application_status(&self, application: &Application) -> ApplicationStatus {
        let deployment_status = self.get_application_deployment_status(application).await;

        let mut seen: HashSet<&ServiceRef> = HashSet::new();
        let mut service_statuses = Vec::new();
        for info in &application.services {
            if !seen.insert(&info.service) {
                continue;
            }
            let reference = &info.service;
            match self
                .store
                .get_service(&reference.short_name, &reference.version)
                .await
            {
                Ok(service) => service_statuses.push(self.get_service_status(&service).await),
                Err(e) => {
                    warn!("Service {} of {} unavailable: {}", reference, application, e);
                    let mut status = ServiceStatus::empty(
                        &reference.short_name,
                        &reference.version,
                        &reference.short_name,
                    );
                    status.error_messages.push(e.to_string());
                    service_statuses.push(status);
                }
            }
        }

        ApplicationStatus::new(deployment_status, service_statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KubernetesConfig;
    use crate::domain::{
        DeploymentStatusValue, KubernetesDeploymentInfo, ServiceDeploymentInfo, ServiceInterface,
        ServicePort,
    };
    use crate::infrastructure::store::{InMemoryStateStore, StateSnapshot};
    use crate::testing::{labels, pod, FakeCluster, FakeMetrics};
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ServiceStatus as K8sServiceStatus,
    };

    const NS: &str = "marshal-workspace";

    fn cart() -> Service {
        Service::new("cart", "1.0.0")
            .with_image("registry/cart:1.0.0")
            .with_interface(ServiceInterface::new("http").with_port(ServicePort::tcp(80, 8080)))
    }

    fn cart_instance() -> ServiceDeploymentInfo {
        ServiceDeploymentInfo::new(cart().reference())
            .with_instance_id("cart-1a2b3c4d")
            .with_replicas(2)
    }

    fn run_labels() -> crate::infrastructure::cluster::Labels {
        labels(&[("app", "cart"), ("version", "1.0.0"), ("run", "cart-1a2b3c4d")])
    }

    struct Harness {
        cluster: Arc<FakeCluster>,
        metrics: Arc<FakeMetrics>,
        reconciler: Arc<Reconciler>,
        aggregator: StatusAggregator,
    }

    fn harness(snapshot: StateSnapshot) -> Harness {
        let cluster = Arc::new(FakeCluster::new());
        let metrics = Arc::new(FakeMetrics::new());
        let reconciler = Arc::new(Reconciler::new(cluster.clone(), KubernetesConfig::default()));
        let store = Arc::new(InMemoryStateStore::from_snapshot(snapshot));
        let aggregator = StatusAggregator::new(reconciler.clone(), metrics.clone(), store);
        Harness {
            cluster,
            metrics,
            reconciler,
            aggregator,
        }
    }

    /// Deploy the cart instance with two pods on two nodes
    async fn deployed(h: &Harness) {
        h.reconciler.reconcile_service(&cart(), &cart_instance()).await.unwrap();
        h.cluster.set_available_replicas("cart-1a2b3c4d", 1);

        // The fake has no load balancer controller; publish an ingress by hand
        let mut k8s_service = h
            .reconciler
            .build_service(&cart(), &cart().interfaces[0], &cart_instance())
            .unwrap();
        k8s_service.status = Some(K8sServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some("203.0.113.7".to_string()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        h.cluster.add_service(NS, k8s_service);

        h.cluster.add_pod(NS, pod("cart-a", "node-1", run_labels(), &[1, 2]));
        h.cluster.add_pod(NS, pod("cart-b", "node-2", run_labels(), &[]));
    }

    #[test]
    fn test_pod_info_fields() {
        let p = pod("cart-a", "node-1", run_labels(), &[1, 2]);
        let now = DateTime::<Utc>::from_timestamp(1_700_003_725, 0).unwrap();
        let info = pod_info(&p, now);

        assert_eq!(info.name, "cart-a");
        assert_eq!(info.host_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(info.node_name.as_deref(), Some("node-1"));
        assert_eq!(info.phase, "Running");
        assert_eq!(info.restarts, 3);
        assert_eq!(info.age.as_deref(), Some("1h 2m 5s"));
        assert!(!info.metrics.available);
    }

    #[tokio::test]
    async fn test_service_status_sums_replicas_and_lists_pods() {
        let h = harness(StateSnapshot::default());
        deployed(&h).await;
        h.metrics.set("cart-a", PodMetric::MemoryUsage, 100.0);
        h.metrics.set("cart-a", PodMetric::CpuLoad, 0.5);
        h.metrics.set("cart-b", PodMetric::MemoryUsage, 300.0);
        h.metrics.set("cart-b", PodMetric::CpuLoad, 1.5);

        let status = h.aggregator.get_service_status(&cart()).await;

        assert_eq!(status.available_replicas, 1);
        assert_eq!(status.requested_replicas, 2);
        assert_eq!(status.pods.len(), 2);
        assert_eq!(status.pods[0].name, "cart-a");
        assert!(status.pods[0].metrics.available);
        assert_eq!(status.nodes.len(), 2);
        assert_eq!(status.nodes[1].node_name, "node-2");
        assert_eq!(status.nodes[1].average_cpu_load, Some(1.5));
        assert_eq!(status.interfaces[0].name, "http");
        assert_eq!(status.interfaces[0].ports, vec![80]);
        assert_eq!(status.interfaces[0].external_ips, vec!["203.0.113.7".to_string()]);
        assert!(status.error_messages.is_empty());
    }

    #[tokio::test]
    async fn test_failed_metric_keeps_pod_and_other_metric() {
        let h = harness(StateSnapshot::default());
        deployed(&h).await;
        h.metrics.set("cart-a", PodMetric::MemoryUsage, 100.0);

        let status = h.aggregator.get_service_status(&cart()).await;

        assert_eq!(status.pods.len(), 2);
        let a = &status.pods[0];
        assert_eq!(a.metrics.memory_usage, Some(100.0));
        assert_eq!(a.metrics.cpu_load, None);
        assert!(!a.metrics.available);
        let b = &status.pods[1];
        assert_eq!(b.metrics, PodMetrics::new(None, None));
        assert_eq!(b.phase, "Running");

        let node_1 = &status.nodes[0];
        assert_eq!(node_1.average_memory_usage, Some(100.0));
        assert_eq!(node_1.average_cpu_load, None);
    }

    #[tokio::test]
    async fn test_cluster_failure_becomes_message() {
        let h = harness(StateSnapshot::default());
        h.cluster.fail_lists("connection refused");

        let status = h.aggregator.get_service_status(&cart()).await;
        assert_eq!(status.available_replicas, 0);
        assert!(status.pods.is_empty());
        // deployments plus the one interface
        assert_eq!(status.error_messages.len(), 2);
        assert!(status.error_messages[0].contains("connection refused"));
    }

    #[tokio::test]
    async fn test_application_status_totals() {
        let instance = cart_instance().with_kubernetes_info(KubernetesDeploymentInfo {
            namespace: NS.to_string(),
            deployment_name: "cart-1a2b3c4d".to_string(),
            service_names: vec!["cart-1a2b3c4d-http".to_string()],
        });
        let application = Application::new("shop", "1.0.0")
            .with_service(instance)
            .with_service(
                ServiceDeploymentInfo::new(ServiceRef::new("ghost", "1.0.0"))
                    .with_instance_id("ghost-00000001"),
            );
        let h = harness(StateSnapshot {
            services: vec![cart()],
            applications: vec![application.clone()],
        });
        deployed(&h).await;

        let status = h.aggregator.get_application_status(&application).await;

        assert_eq!(status.deployment_status.value, DeploymentStatusValue::Incomplete);
        assert_eq!(status.total_services, 2);
        assert_eq!(status.total_pods, 2);
        assert_eq!(status.total_available_replicas, 1);
        assert_eq!(status.total_requested_replicas, 2);
        let ghost = &status.service_statuses[1];
        assert_eq!(ghost.short_name, "ghost");
        assert_eq!(ghost.error_messages, vec!["Service ghost 1.0.0 not found".to_string()]);
    }
}

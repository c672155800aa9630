//! In-memory fakes of the external collaborators, for tests

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ContainerStatus, Namespace, Pod, PodSpec, PodStatus, Secret, Service as K8sService,
    ServiceAccount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use chrono::{DateTime, Utc};
use kube::Resource;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::domain::Service;
use crate::error::{BuildError, ClusterError, MetricsError};
use crate::infrastructure::builder::{BuildStatus, ImageBuilder, PendingBuild};
use crate::infrastructure::cluster::{ClusterClient, Labels};
use crate::infrastructure::metrics::{MetricsBackend, PodMetric};

/// Poll `condition` until it holds, panicking after about five seconds
pub async fn eventually<F, Fut>(condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was not met in time");
}

pub fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Pod with the given labels, scheduled on `node`
pub fn pod(name: &str, node: &str, pod_labels: Labels, restarts: &[i32]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(pod_labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            host_ip: Some("10.0.0.1".to_string()),
            start_time: Some(Time(
                DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
            )),
            container_statuses: Some(
                restarts
                    .iter()
                    .map(|r| ContainerStatus {
                        restart_count: *r,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
    }
}

#[derive(Default)]
struct ClusterState {
    deployments: Vec<(String, Deployment)>,
    services: Vec<(String, K8sService)>,
    pods: Vec<(String, Pod)>,
    namespaces: Vec<Namespace>,
    secrets: Vec<(String, Secret)>,
    service_accounts: Vec<(String, ServiceAccount)>,
    jobs: Vec<(String, Job)>,
    deployment_creates: usize,
    service_creates: usize,
    deletes: Vec<String>,
    fail_lists: Option<String>,
    fail_creates: Option<String>,
    hidden_lists: usize,
}

/// True if `resource_labels` contains every entry of `selector`
fn labels_match(resource_labels: Option<&Labels>, selector: &Labels) -> bool {
    selector.iter().all(|(k, v)| {
        resource_labels
            .and_then(|labels| labels.get(k))
            .is_some_and(|value| value == v)
    })
}

fn find<K: Resource + Clone>(items: &[(String, K)], namespace: &str, name: &str) -> Option<K> {
    items
        .iter()
        .find(|(ns, k)| ns == namespace && k.meta().name.as_deref() == Some(name))
        .map(|(_, k)| k.clone())
}

fn matching<K: Resource + Clone>(items: &[(String, K)], namespace: &str, selector: &Labels) -> Vec<K> {
    items
        .iter()
        .filter(|(ns, k)| ns == namespace && labels_match(k.meta().labels.as_ref(), selector))
        .map(|(_, k)| k.clone())
        .collect()
}

fn insert<K: Resource + Clone>(
    items: &mut Vec<(String, K)>,
    kind: &str,
    namespace: &str,
    object: &K,
) -> Result<K, ClusterError> {
    let name = object.meta().name.clone().unwrap_or_default();
    if find(items, namespace, &name).is_some() {
        return Err(ClusterError::AlreadyExists {
            kind: kind.to_string(),
            name,
            namespace: namespace.to_string(),
        });
    }
    items.push((namespace.to_string(), object.clone()));
    Ok(object.clone())
}

fn remove<K: Resource + Clone>(
    items: &mut Vec<(String, K)>,
    kind: &str,
    namespace: &str,
    name: &str,
) -> Result<(), ClusterError> {
    let before = items.len();
    items.retain(|(ns, k)| !(ns == namespace && k.meta().name.as_deref() == Some(name)));
    if items.len() == before {
        return Err(ClusterError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        });
    }
    Ok(())
}

/// In-memory cluster with call counters and failure injection
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
    create_delay: Option<Duration>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before every create, widening race windows
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn deployment_creates(&self) -> usize {
        self.state().deployment_creates
    }

    pub fn service_creates(&self) -> usize {
        self.state().service_creates
    }

    pub fn deployments(&self) -> Vec<Deployment> {
        self.state().deployments.iter().map(|(_, d)| d.clone()).collect()
    }

    pub fn services(&self) -> Vec<K8sService> {
        self.state().services.iter().map(|(_, s)| s.clone()).collect()
    }

    /// Names of deleted resources as `Kind/name`, in order
    pub fn deletes(&self) -> Vec<String> {
        self.state().deletes.clone()
    }

    /// Make every list call fail
    pub fn fail_lists(&self, message: &str) {
        self.state().fail_lists = Some(message.to_string());
    }

    /// Make every create call fail
    pub fn fail_creates(&self, message: &str) {
        self.state().fail_creates = Some(message.to_string());
    }

    /// The next `n` Deployment/Service lists return nothing, as if another
    /// process created the resource in between
    pub fn hide_next_lists(&self, n: usize) {
        self.state().hidden_lists = n;
    }

    pub fn add_deployment(&self, namespace: &str, deployment: Deployment) {
        self.state()
            .deployments
            .push((namespace.to_string(), deployment));
    }

    pub fn add_pod(&self, namespace: &str, pod: Pod) {
        self.state().pods.push((namespace.to_string(), pod));
    }

    pub fn add_secret(&self, namespace: &str, secret: Secret) {
        self.state().secrets.push((namespace.to_string(), secret));
    }

    pub fn add_service(&self, namespace: &str, service: K8sService) {
        self.state().services.push((namespace.to_string(), service));
    }

    /// Set the available replica count reported for a Deployment
    pub fn set_available_replicas(&self, name: &str, available: i32) {
        let mut state = self.state();
        for (_, deployment) in state.deployments.iter_mut() {
            if deployment.metadata.name.as_deref() == Some(name) {
                deployment.status = Some(DeploymentStatus {
                    available_replicas: Some(available),
                    ..Default::default()
                });
            }
        }
    }

    fn check_list(&self) -> Result<bool, ClusterError> {
        let mut state = self.state();
        if let Some(message) = &state.fail_lists {
            return Err(ClusterError::api("list", message));
        }
        if state.hidden_lists > 0 {
            state.hidden_lists -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    async fn check_create(&self) -> Result<(), ClusterError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        match &self.state().fail_creates {
            Some(message) => Err(ClusterError::api("create", message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {

    async fn get_deployments_by_labels(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Vec<Deployment>, ClusterError> {
        if self.check_list()? {
            return Ok(Vec::new());
        }
        Ok(matching(&self.state().deployments, namespace, selector))
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError> {
        self.check_create().await?;
        let mut state = self.state();
        let created = insert(&mut state.deployments, "Deployment", namespace, deployment)?;
        state.deployment_creates += 1;
        Ok(created)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state();
        remove(&mut state.deployments, "Deployment", namespace, name)?;
        state.deletes.push(format!("Deployment/{}", name));
        Ok(())
    }

    async fn get_services_by_labels(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Vec<K8sService>, ClusterError> {
        if self.check_list()? {
            return Ok(Vec::new());
        }
        Ok(matching(&self.state().services, namespace, selector))
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &K8sService,
    ) -> Result<K8sService, ClusterError> {
        self.check_create().await?;
        let mut state = self.state();
        let created = insert(&mut state.services, "Service", namespace, service)?;
        state.service_creates += 1;
        Ok(created)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state();
        remove(&mut state.services, "Service", namespace, name)?;
        state.deletes.push(format!("Service/{}", name));
        Ok(())
    }

    async fn get_pods_by_labels(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Vec<Pod>, ClusterError> {
        if let Some(message) = &self.state().fail_lists {
            return Err(ClusterError::api("list", message));
        }
        Ok(matching(&self.state().pods, namespace, selector))
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, ClusterError> {
        Ok(self
            .state()
            .namespaces
            .iter()
            .find(|n| n.metadata.name.as_deref() == Some(name))
            .cloned())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, ClusterError> {
        let mut state = self.state();
        let name = namespace.metadata.name.clone().unwrap_or_default();
        if state
            .namespaces
            .iter()
            .any(|n| n.metadata.name.as_deref() == Some(name.as_str()))
        {
            return Err(ClusterError::AlreadyExists {
                kind: "Namespace".to_string(),
                name,
                namespace: String::new(),
            });
        }
        state.namespaces.push(namespace.clone());
        Ok(namespace.clone())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError> {
        Ok(find(&self.state().secrets, namespace, name))
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, ClusterError> {
        Ok(find(&self.state().service_accounts, namespace, name))
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount, ClusterError> {
        insert(
            &mut self.state().service_accounts,
            "ServiceAccount",
            namespace,
            account,
        )
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, ClusterError> {
        Ok(find(&self.state().jobs, namespace, name))
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, ClusterError> {
        insert(&mut self.state().jobs, "Job", namespace, job)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        remove(&mut self.state().jobs, "Job", namespace, name)
    }
}

enum BuildBehavior {
    Succeed,
    Fail(String),
    RefuseToStart(String),
    Manual,
}

#[derive(Default)]
struct BuilderState {
    started: Vec<String>,
    waiting: HashMap<String, oneshot::Sender<Result<String, BuildError>>>,
    finished: HashMap<String, BuildStatus>,
}

/// Image builder whose outcome is chosen by the test
pub struct FakeBuilder {
    behavior: BuildBehavior,
    state: Mutex<BuilderState>,
}

impl FakeBuilder {
    fn with_behavior(behavior: BuildBehavior) -> Self {
        Self {
            behavior,
            state: Mutex::new(BuilderState::default()),
        }
    }

    /// Every build succeeds with `registry/<short>:<version>`
    pub fn succeeding() -> Self {
        Self::with_behavior(BuildBehavior::Succeed)
    }

    pub fn failing(message: &str) -> Self {
        Self::with_behavior(BuildBehavior::Fail(message.to_string()))
    }

    pub fn refusing(message: &str) -> Self {
        Self::with_behavior(BuildBehavior::RefuseToStart(message.to_string()))
    }

    /// Builds stay running until [`FakeBuilder::complete`] is called
    pub fn manual() -> Self {
        Self::with_behavior(BuildBehavior::Manual)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BuilderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Short names of services whose build was started
    pub fn started(&self) -> Vec<String> {
        self.state().started.clone()
    }

    /// Finish the running build of a service; false if none is waiting
    pub fn complete(&self, short_name: &str, result: Result<String, BuildError>) -> bool {
        let mut state = self.state();
        let Some(sender) = state.waiting.remove(short_name) else {
            return false;
        };
        let status = match &result {
            Ok(_) => BuildStatus::Succeeded,
            Err(e) => BuildStatus::Failed {
                message: e.to_string(),
            },
        };
        state.finished.insert(short_name.to_string(), status);
        sender.send(result).is_ok()
    }
}

#[async_trait]
impl ImageBuilder for FakeBuilder {
    async fn build(&self, service: &Service) -> Result<PendingBuild, BuildError> {
        let name = format!("build-{}", service.short_name);
        if let BuildBehavior::RefuseToStart(message) = &self.behavior {
            return Err(BuildError::StartFailed {
                name,
                message: message.clone(),
            });
        }

        let (sender, pending) = PendingBuild::channel(&name);
        let mut state = self.state();
        state.started.push(service.short_name.clone());
        match &self.behavior {
            BuildBehavior::Succeed => {
                let _ = sender.send(Ok(format!(
                    "registry/{}:{}",
                    service.short_name, service.version
                )));
            }
            BuildBehavior::Fail(message) => {
                let _ = sender.send(Err(BuildError::Failed {
                    name,
                    message: message.clone(),
                }));
            }
            _ => {
                state.waiting.insert(service.short_name.clone(), sender);
            }
        }
        Ok(pending)
    }

    async fn get_build(&self, name: &str) -> Result<BuildStatus, BuildError> {
        let short_name = name.trim_start_matches("build-");
        let state = self.state();
        if state.waiting.contains_key(short_name) {
            return Ok(BuildStatus::Running);
        }
        Ok(state
            .finished
            .get(short_name)
            .cloned()
            .unwrap_or(BuildStatus::NotFound))
    }
}

/// Metrics backend answering from a table; unknown queries fail
#[derive(Default)]
pub struct FakeMetrics {
    values: Mutex<HashMap<(String, PodMetric), f64>>,
}

impl FakeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pod_name: &str, metric: PodMetric, value: f64) {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((pod_name.to_string(), metric), value);
    }
}

#[async_trait]
impl MetricsBackend for FakeMetrics {
    async fn query_pod_metric(
        &self,
        pod_name: &str,
        metric: PodMetric,
    ) -> Result<f64, MetricsError> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(pod_name.to_string(), metric))
            .copied()
            .ok_or(MetricsError::Empty)
    }
}

//! Cluster access facade
//!
//! Thin typed access to the Kubernetes API: get, list by labels, create and
//! delete for the resource kinds the control plane touches. No business
//! logic lives here.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    Client, Config, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::debug;

use crate::error::ClusterError;

/// Label set used both for labelling and for selecting resources
pub type Labels = BTreeMap<String, String>;

/// Render labels as a Kubernetes label selector (`a=b,c=d`)
pub fn selector_string(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// External IPs (or hostnames) assigned to a Service by its load balancer
pub fn public_ips_of_service(service: &Service) -> Vec<String> {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| {
            ingress
                .iter()
                .filter_map(|i| i.ip.clone().or_else(|| i.hostname.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// Ports exposed by a Service
pub fn public_ports_of_service(service: &Service) -> Vec<i32> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| ports.iter().map(|p| p.port).collect())
        .unwrap_or_default()
}

/// Typed access to the Kubernetes API
#[async_trait]
pub trait ClusterClient: Send + Sync {
    // Deployments
    async fn get_deployments_by_labels(
        &self,
        namespace: &str,
        labels: &Labels,
    ) -> Result<Vec<Deployment>, ClusterError>;
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError>;
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    // Services
    async fn get_services_by_labels(
        &self,
        namespace: &str,
        labels: &Labels,
    ) -> Result<Vec<Service>, ClusterError>;
    async fn create_service(&self, namespace: &str, service: &Service)
        -> Result<Service, ClusterError>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    // Pods
    async fn get_pods_by_labels(
        &self,
        namespace: &str,
        labels: &Labels,
    ) -> Result<Vec<Pod>, ClusterError>;

    // Namespaces
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, ClusterError>;
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, ClusterError>;

    // Secrets
    async fn get_secret(&self, namespace: &str, name: &str)
        -> Result<Option<Secret>, ClusterError>;

    // Service accounts
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, ClusterError>;
    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount, ClusterError>;

    // Jobs (image builds)
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, ClusterError>;
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, ClusterError>;
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}

/// [`ClusterClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the inferred kubeconfig or in-cluster config
    pub async fn infer() -> Result<Self, ClusterError> {
        let config = Config::infer()
            .await
            .map_err(|e| ClusterError::api("infer kubeconfig", e))?;
        let client =
            Client::try_from(config).map_err(|e| ClusterError::api("create client", e))?;
        Ok(Self::new(client))
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_error(err: kube::Error, operation: &str, kind: &str, name: &str, namespace: &str) -> ClusterError {
    match &err {
        kube::Error::Api(response) if response.code == 409 => ClusterError::AlreadyExists {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        },
        kube::Error::Api(response) if response.code == 404 => ClusterError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        },
        _ => ClusterError::api(format!("{} {}", operation, kind), err.to_string()),
    }
}

async fn get_opt<K>(api: &Api<K>, kind: &str, namespace: &str, name: &str) -> Result<Option<K>, ClusterError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    debug!("Getting {} {} in {}", kind, name, namespace);
    api.get_opt(name)
        .await
        .map_err(|e| map_error(e, "get", kind, name, namespace))
}

async fn list<K>(api: &Api<K>, kind: &str, namespace: &str, labels: &Labels) -> Result<Vec<K>, ClusterError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let selector = selector_string(labels);
    debug!("Listing {}s in {} with labels {}", kind, namespace, selector);
    let lp = ListParams::default().labels(&selector);
    api.list(&lp)
        .await
        .map(|list| list.items)
        .map_err(|e| map_error(e, "list", kind, "", namespace))
}

async fn create<K>(api: &Api<K>, kind: &str, namespace: &str, object: &K) -> Result<K, ClusterError>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = object.meta().name.clone().unwrap_or_default();
    debug!("Creating {} {} in {}", kind, name, namespace);
    api.create(&PostParams::default(), object)
        .await
        .map_err(|e| map_error(e, "create", kind, &name, namespace))
}

async fn delete<K>(api: &Api<K>, kind: &str, namespace: &str, name: &str) -> Result<(), ClusterError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    debug!("Deleting {} {} in {}", kind, name, namespace);
    api.delete(name, &DeleteParams::background())
        .await
        .map(|_| ())
        .map_err(|e| map_error(e, "delete", kind, name, namespace))
}

#[async_trait]
impl ClusterClient for KubeCluster {

    async fn get_deployments_by_labels(
        &self,
        namespace: &str,
        labels: &Labels,
    ) -> Result<Vec<Deployment>, ClusterError> {
        list(&self.namespaced(namespace), "Deployment", namespace, labels).await
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError> {
        create(&self.namespaced(namespace), "Deployment", namespace, deployment).await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        delete::<Deployment>(&self.namespaced(namespace), "Deployment", namespace, name).await
    }

    async fn get_services_by_labels(
        &self,
        namespace: &str,
        labels: &Labels,
    ) -> Result<Vec<Service>, ClusterError> {
        list(&self.namespaced(namespace), "Service", namespace, labels).await
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError> {
        create(&self.namespaced(namespace), "Service", namespace, service).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        delete::<Service>(&self.namespaced(namespace), "Service", namespace, name).await
    }

    async fn get_pods_by_labels(
        &self,
        namespace: &str,
        labels: &Labels,
    ) -> Result<Vec<Pod>, ClusterError> {
        list(&self.namespaced(namespace), "Pod", namespace, labels).await
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        get_opt(&api, "Namespace", "", name).await
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        create(&api, "Namespace", "", namespace).await
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError> {
        get_opt(&self.namespaced(namespace), "Secret", namespace, name).await
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, ClusterError> {
        get_opt(&self.namespaced(namespace), "ServiceAccount", namespace, name).await
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount, ClusterError> {
        create(&self.namespaced(namespace), "ServiceAccount", namespace, account).await
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, ClusterError> {
        get_opt(&self.namespaced(namespace), "Job", namespace, name).await
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, ClusterError> {
        create(&self.namespaced(namespace), "Job", namespace, job).await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        delete::<Job>(&self.namespaced(namespace), "Job", namespace, name).await
    }
}

//! Resource reconciler - finds or creates Kubernetes resources for service
//! instances
//!
//! Every Deployment and Service created here carries the labels
//! `{app, version, run}` (Services add `interface`). The `run` label holds
//! the instance id and is the only key used to rediscover resources, so
//! reconciling the same instance again never creates a duplicate.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Pod, PodSpec, PodTemplateSpec, Service as K8sService,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::config::KubernetesConfig;
use crate::domain::application::{KAFKA_TOPIC_INPUT, KAFKA_TOPIC_OUTPUT};
use crate::domain::naming;
use crate::domain::status::{fold_deployment_status, InstanceObservation, InstanceReport};
use crate::domain::{
    Application, ApplicationDeploymentStatus, DeploymentStatusValue, Service, ServiceDeploymentInfo,
    ServiceInterface, ServiceRef, TopicRoleKind,
};
use crate::error::{ClusterError, KubernetesResourceError};
use crate::infrastructure::cluster::{
    public_ips_of_service, public_ports_of_service, selector_string, ClusterClient, Labels,
};

/// Replicas reported available by a Deployment
pub fn available_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0)
}

/// Replicas requested in a Deployment's spec (Kubernetes defaults to 1)
pub fn requested_replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1)
}

/// Finds or creates the Kubernetes resources of service instances
pub struct Reconciler {
    cluster: Arc<dyn ClusterClient>,
    config: KubernetesConfig,
    instance_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(cluster: Arc<dyn ClusterClient>, config: KubernetesConfig) -> Self {
        Self {
            cluster,
            config,
            instance_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Serialize find-or-create for one instance id within this process
    async fn lock_instance(&self, instance_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .instance_locks
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(instance_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    fn service_labels(&self, service: &ServiceRef) -> Labels {
        let mut labels = Labels::new();
        labels.insert(self.config.app_label_key.clone(), service.short_name.clone());
        labels.insert(self.config.version_label_key.clone(), service.version.clone());
        labels
    }

    fn instance_labels(&self, service: &ServiceRef, instance_id: &str) -> Labels {
        let mut labels = self.service_labels(service);
        labels.insert(self.config.run_label_key.clone(), instance_id.to_string());
        labels
    }

    fn interface_labels(&self, service: &ServiceRef, instance_id: &str, interface: &str) -> Labels {
        let mut labels = self.instance_labels(service, instance_id);
        labels.insert(self.config.interface_label_key.clone(), interface.to_string());
        labels
    }

    fn run_selector(&self, instance_id: &str) -> Labels {
        let mut labels = Labels::new();
        labels.insert(self.config.run_label_key.clone(), instance_id.to_string());
        labels
    }

    /// Namespace an instance lives in: the recorded one, else the configured one
    fn instance_namespace<'a>(&'a self, info: &'a ServiceDeploymentInfo) -> &'a str {
        info.kubernetes_deployment_info
            .as_ref()
            .map(|k| k.namespace.as_str())
            .unwrap_or(&self.config.namespace)
    }

    async fn find_deployment(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Option<Deployment>, KubernetesResourceError> {
        let mut found = self
            .cluster
            .get_deployments_by_labels(namespace, selector)
            .await
            .map_err(|source| KubernetesResourceError::Lookup {
                kind: "Deployment",
                selector: selector_string(selector),
                source,
            })?;
        match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            count => Err(KubernetesResourceError::Duplicate {
                kind: "Deployment",
                selector: selector_string(selector),
                count,
            }),
        }
    }

    async fn find_service(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Option<K8sService>, KubernetesResourceError> {
        let mut found = self
            .cluster
            .get_services_by_labels(namespace, selector)
            .await
            .map_err(|source| KubernetesResourceError::Lookup {
                kind: "Service",
                selector: selector_string(selector),
                source,
            })?;
        match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            count => Err(KubernetesResourceError::Duplicate {
                kind: "Service",
                selector: selector_string(selector),
                count,
            }),
        }
    }

    /// Find the Deployment of an instance, creating it if there is none
    pub async fn reconcile_service(
        &self,
        service: &Service,
        info: &ServiceDeploymentInfo,
    ) -> Result<Deployment, KubernetesResourceError> {
        let _guard = self.lock_instance(&info.instance_id).await;
        let namespace = self.config.namespace.as_str();
        let selector = self.instance_labels(&service.reference(), &info.instance_id);

        if let Some(existing) = self.find_deployment(namespace, &selector).await? {
            debug!(instance_id = %info.instance_id, "Deployment already exists");
            return Ok(existing);
        }

        let deployment = self.build_deployment(service, info)?;
        let name = deployment.metadata.name.clone().unwrap_or_default();

        match self.cluster.create_deployment(namespace, &deployment).await {
            Ok(created) => {
                info!(instance_id = %info.instance_id, "Created Deployment {}", name);
                Ok(created)
            }
            Err(source) if source.is_already_exists() => {
                warn!(
                    instance_id = %info.instance_id,
                    "Deployment {} was created concurrently, looking it up again", name
                );
                match self.find_deployment(namespace, &selector).await? {
                    Some(existing) => Ok(existing),
                    None => Err(KubernetesResourceError::Create {
                        kind: "Deployment",
                        name,
                        source,
                    }),
                }
            }
            Err(source) => Err(KubernetesResourceError::Create {
                kind: "Deployment",
                name,
                source,
            }),
        }
    }

    /// Find the Kubernetes Service exposing one interface of an instance,
    /// creating it if there is none
    pub async fn reconcile_interface(
        &self,
        service: &Service,
        interface: &ServiceInterface,
        info: &ServiceDeploymentInfo,
    ) -> Result<K8sService, KubernetesResourceError> {
        let _guard = self.lock_instance(&info.instance_id).await;
        let namespace = self.config.namespace.as_str();
        let selector =
            self.interface_labels(&service.reference(), &info.instance_id, &interface.name);

        if let Some(existing) = self.find_service(namespace, &selector).await? {
            debug!(
                instance_id = %info.instance_id,
                "Service for interface {} already exists", interface.name
            );
            return Ok(existing);
        }

        let k8s_service = self.build_service(service, interface, info)?;
        let name = k8s_service.metadata.name.clone().unwrap_or_default();

        match self.cluster.create_service(namespace, &k8s_service).await {
            Ok(created) => {
                info!(instance_id = %info.instance_id, "Created Service {}", name);
                Ok(created)
            }
            Err(source) if source.is_already_exists() => {
                warn!(
                    instance_id = %info.instance_id,
                    "Service {} was created concurrently, looking it up again", name
                );
                match self.find_service(namespace, &selector).await? {
                    Some(existing) => Ok(existing),
                    None => Err(KubernetesResourceError::Create {
                        kind: "Service",
                        name,
                        source,
                    }),
                }
            }
            Err(source) => Err(KubernetesResourceError::Create {
                kind: "Service",
                name,
                source,
            }),
        }
    }

    fn environment(&self, service: &Service, info: &ServiceDeploymentInfo) -> Vec<EnvVar> {
        let mut env: Vec<EnvVar> = info
            .environment_variables
            .iter()
            .map(|v| EnvVar {
                name: v.name.clone(),
                value: Some(v.value.clone()),
                ..Default::default()
            })
            .collect();

        if service.kafka_enabled {
            let mut kafka = self.config.kafka.environment();
            if let Some(topic) = info.topic(TopicRoleKind::Input) {
                kafka.push((KAFKA_TOPIC_INPUT.to_string(), topic.to_string()));
            }
            if let Some(topic) = info.topic(TopicRoleKind::Output) {
                kafka.push((KAFKA_TOPIC_OUTPUT.to_string(), topic.to_string()));
            }
            env.extend(kafka.into_iter().map(|(name, value)| EnvVar {
                name,
                value: Some(value),
                ..Default::default()
            }));
        }

        env
    }

    /// Deployment object for an instance
    pub fn build_deployment(
        &self,
        service: &Service,
        info: &ServiceDeploymentInfo,
    ) -> Result<Deployment, KubernetesResourceError> {
        let image = service
            .image
            .clone()
            .ok_or_else(|| KubernetesResourceError::MissingImage {
                service: service.reference().to_string(),
            })?;
        let name = naming::deployment_name(&info.instance_id)?;
        let labels = self.instance_labels(&service.reference(), &info.instance_id);

        let mut pod_labels = info.labels.clone();
        pod_labels.extend(labels.clone());

        let ports: Vec<ContainerPort> = service
            .interfaces
            .iter()
            .flat_map(|i| i.ports.iter())
            .map(|p| ContainerPort {
                container_port: p.target_port,
                protocol: Some(p.protocol.as_str().to_string()),
                ..Default::default()
            })
            .collect();

        Ok(Deployment {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.config.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(info.replicas),
                selector: LabelSelector {
                    match_labels: Some(self.run_selector(&info.instance_id)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some(info.restart_policy.as_str().to_string()),
                        containers: vec![Container {
                            name: service.short_name.clone(),
                            image: Some(image),
                            image_pull_policy: Some(info.image_pull_policy.as_str().to_string()),
                            ports: (!ports.is_empty()).then_some(ports),
                            env: Some(self.environment(service, info)),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Service object exposing one interface of an instance
    pub fn build_service(
        &self,
        service: &Service,
        interface: &ServiceInterface,
        info: &ServiceDeploymentInfo,
    ) -> Result<K8sService, KubernetesResourceError> {
        if interface.ports.is_empty() {
            return Err(KubernetesResourceError::NoPorts {
                service: service.reference().to_string(),
                interface: interface.name.clone(),
            });
        }
        let name = naming::interface_service_name(&info.instance_id, &interface.name)?;

        let ports = interface
            .ports
            .iter()
            .map(|p| ServicePort {
                name: Some(format!(
                    "{}-{}",
                    p.protocol.as_str().to_lowercase(),
                    p.exposed_port
                )),
                port: p.exposed_port,
                target_port: Some(IntOrString::Int(p.target_port)),
                protocol: Some(p.protocol.as_str().to_string()),
                ..Default::default()
            })
            .collect();

        Ok(K8sService {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.config.namespace.clone()),
                labels: Some(self.interface_labels(
                    &service.reference(),
                    &info.instance_id,
                    &interface.name,
                )),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(self.config.service_type.clone()),
                ports: Some(ports),
                selector: Some(self.run_selector(&info.instance_id)),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// All Deployments of a service version, across instances
    pub async fn get_deployments_of_service(
        &self,
        service: &ServiceRef,
    ) -> Result<Vec<Deployment>, KubernetesResourceError> {
        let selector = self.service_labels(service);
        self.cluster
            .get_deployments_by_labels(&self.config.namespace, &selector)
            .await
            .map_err(|source| KubernetesResourceError::Lookup {
                kind: "Deployment",
                selector: selector_string(&selector),
                source,
            })
    }

    pub async fn get_deployment_of_instance(
        &self,
        info: &ServiceDeploymentInfo,
    ) -> Result<Option<Deployment>, KubernetesResourceError> {
        let selector = self.instance_labels(&info.service, &info.instance_id);
        self.find_deployment(self.instance_namespace(info), &selector)
            .await
    }

    /// Services exposing an interface of a service version, across instances
    pub async fn get_interface_service_of_service(
        &self,
        service: &ServiceRef,
        interface_name: &str,
    ) -> Result<Vec<K8sService>, KubernetesResourceError> {
        let mut selector = self.service_labels(service);
        selector.insert(
            self.config.interface_label_key.clone(),
            interface_name.to_string(),
        );
        self.cluster
            .get_services_by_labels(&self.config.namespace, &selector)
            .await
            .map_err(|source| KubernetesResourceError::Lookup {
                kind: "Service",
                selector: selector_string(&selector),
                source,
            })
    }

    pub async fn get_interface_service_of_instance(
        &self,
        info: &ServiceDeploymentInfo,
        interface_name: &str,
    ) -> Result<Option<K8sService>, KubernetesResourceError> {
        let selector = self.interface_labels(&info.service, &info.instance_id, interface_name);
        self.find_service(self.instance_namespace(info), &selector)
            .await
    }

    /// Pods selected by a Deployment
    pub async fn get_pods_of_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<Vec<Pod>, KubernetesResourceError> {
        let Some(selector) = deployment
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .filter(|labels| !labels.is_empty())
        else {
            return Ok(Vec::new());
        };
        let namespace = deployment
            .metadata
            .namespace
            .as_deref()
            .unwrap_or(&self.config.namespace);

        self.cluster
            .get_pods_by_labels(namespace, &selector)
            .await
            .map_err(|source| KubernetesResourceError::Lookup {
                kind: "Pod",
                selector: selector_string(&selector),
                source,
            })
    }

    /// True if any instance of the service version has a Deployment
    #[allow(dead_code)]
    pub async fn is_service_deployed(
        &self,
        service: &ServiceRef,
    ) -> Result<bool, KubernetesResourceError> {
        Ok(!self.get_deployments_of_service(service).await?.is_empty())
    }

    /// True if the instance has its Deployment and a Service per interface
    #[allow(dead_code)]
    pub async fn is_instance_deployed(
        &self,
        service: &Service,
        info: &ServiceDeploymentInfo,
    ) -> Result<bool, KubernetesResourceError> {
        if self.get_deployment_of_instance(info).await?.is_none() {
            return Ok(false);
        }
        for interface in &service.interfaces {
            if self
                .get_interface_service_of_instance(info, &interface.name)
                .await?
                .is_none()
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Deployment status of an application, folded over all its instances.
    /// Lookup failures become UNKNOWN rather than errors.
    pub async fn application_deployment_status(
        &self,
        application: &Application,
    ) -> ApplicationDeploymentStatus {
        let mut reports = Vec::with_capacity(application.services.len());

        for info in &application.services {
            let observation = if info.kubernetes_deployment_info.is_none() {
                InstanceObservation::NotDeployed
            } else {
                match self.get_deployment_of_instance(info).await {
                    Ok(Some(deployment)) => InstanceObservation::Live {
                        available: available_replicas(&deployment),
                        requested: requested_replicas(&deployment),
                    },
                    Ok(None) => InstanceObservation::Missing,
                    Err(e) => {
                        warn!(instance_id = %info.instance_id, "Deployment lookup failed: {}", e);
                        InstanceObservation::LookupFailed(e.to_string())
                    }
                }
            };
            reports.push(InstanceReport {
                service: info.service.clone(),
                instance_id: info.instance_id.clone(),
                observation,
            });
        }

        fold_deployment_status(&reports)
    }

    /// True only if every instance resolves to a healthy Deployment
    #[allow(dead_code)]
    pub async fn is_application_deployed(&self, application: &Application) -> bool {
        self.application_deployment_status(application).await.value
            == DeploymentStatusValue::Deployed
    }

    /// Delete an instance's Services, then its Deployment. Missing resources
    /// are ignored.
    pub async fn undeploy_instance(
        &self,
        info: &ServiceDeploymentInfo,
    ) -> Result<(), KubernetesResourceError> {
        let _guard = self.lock_instance(&info.instance_id).await;
        let namespace = self.instance_namespace(info);
        let selector = self.run_selector(&info.instance_id);

        let services = self
            .cluster
            .get_services_by_labels(namespace, &selector)
            .await
            .map_err(|source| KubernetesResourceError::Lookup {
                kind: "Service",
                selector: selector_string(&selector),
                source,
            })?;
        for service in services {
            let name = service.metadata.name.unwrap_or_default();
            ignore_missing(self.cluster.delete_service(namespace, &name).await).map_err(
                |source| KubernetesResourceError::Delete {
                    kind: "Service",
                    name: name.clone(),
                    source,
                },
            )?;
            info!(instance_id = %info.instance_id, "Deleted Service {}", name);
        }

        let deployments = self
            .cluster
            .get_deployments_by_labels(namespace, &selector)
            .await
            .map_err(|source| KubernetesResourceError::Lookup {
                kind: "Deployment",
                selector: selector_string(&selector),
                source,
            })?;
        for deployment in deployments {
            let name = deployment.metadata.name.unwrap_or_default();
            ignore_missing(self.cluster.delete_deployment(namespace, &name).await).map_err(
                |source| KubernetesResourceError::Delete {
                    kind: "Deployment",
                    name: name.clone(),
                    source,
                },
            )?;
            info!(instance_id = %info.instance_id, "Deleted Deployment {}", name);
        }

        Ok(())
    }

    #[allow(dead_code)]
    pub async fn public_ips_of_interface(
        &self,
        info: &ServiceDeploymentInfo,
        interface_name: &str,
    ) -> Result<Vec<String>, KubernetesResourceError> {
        Ok(self
            .get_interface_service_of_instance(info, interface_name)
            .await?
            .map(|s| public_ips_of_service(&s))
            .unwrap_or_default())
    }

    #[allow(dead_code)]
    pub async fn public_ports_of_interface(
        &self,
        info: &ServiceDeploymentInfo,
        interface_name: &str,
    ) -> Result<Vec<i32>, KubernetesResourceError> {
        Ok(self
            .get_interface_service_of_instance(info, interface_name)
            .await?
            .map(|s| public_ports_of_service(&s))
            .unwrap_or_default())
    }
}

fn ignore_missing(result: Result<(), ClusterError>) -> Result<(), ClusterError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

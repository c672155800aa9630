//! Image build gateway
//!
//! Builds a service's container image from its git repository. A build is
//! started with [`ImageBuilder::build`] and its result arrives later through
//! the returned [`PendingBuild`].
//!
//! [`KanikoBuilder`] runs each build as a Kubernetes Job executing kaniko and
//! watches the Job until it completes, fails, or times out.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::BuildConfig;
use crate::domain::naming;
use crate::domain::Service;
use crate::error::BuildError;

use super::cluster::ClusterClient;

/// Handle to a started build, resolved once with the image reference
#[derive(Debug)]
pub struct PendingBuild {
    name: String,
    receiver: oneshot::Receiver<Result<String, BuildError>>,
}

impl PendingBuild {
    /// Create a handle and the sender that completes it
    pub fn channel(name: impl Into<String>) -> (oneshot::Sender<Result<String, BuildError>>, Self) {
        let (sender, receiver) = oneshot::channel();
        (
            sender,
            Self {
                name: name.into(),
                receiver,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the build to finish
    pub async fn wait(self) -> Result<String, BuildError> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(BuildError::Abandoned { name: self.name }),
        }
    }
}

/// Observed state of a build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    NotFound,
    Running,
    Succeeded,
    Failed { message: String },
}

/// Builds container images for services
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Start a build; returning `Ok` acknowledges that it started
    async fn build(&self, service: &Service) -> Result<PendingBuild, BuildError>;

    #[allow(dead_code)]
    async fn get_build(&self, name: &str) -> Result<BuildStatus, BuildError>;
}

/// Builds images with kaniko running as Kubernetes Jobs
pub struct KanikoBuilder {
    cluster: Arc<dyn ClusterClient>,
    config: BuildConfig,
}

impl KanikoBuilder {
    pub fn new(cluster: Arc<dyn ClusterClient>, config: BuildConfig) -> Self {
        Self { cluster, config }
    }

    async fn delete_existing_job(&self, name: &str) -> Result<(), BuildError> {
        match self.cluster.delete_job(&self.config.namespace, name).await {
            Ok(()) => {
                debug!("Deleted previous build job {}", name);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(BuildError::StartFailed {
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Make sure the build namespace, its service account and the registry
    /// secret exist before a build Job is created
    async fn prepare(&self, name: &str) -> Result<(), BuildError> {
        let start_failed = |message: String| BuildError::StartFailed {
            name: name.to_string(),
            message,
        };
        let namespace = self.config.namespace.as_str();

        let existing = self
            .cluster
            .get_namespace(namespace)
            .await
            .map_err(|e| start_failed(e.to_string()))?;
        if existing.is_none() {
            let object = Namespace {
                metadata: ObjectMeta {
                    name: Some(namespace.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            match self.cluster.create_namespace(&object).await {
                Ok(_) => info!("Created build namespace {}", namespace),
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(start_failed(e.to_string())),
            }
        }

        let account = self.config.service_account.as_str();
        let existing = self
            .cluster
            .get_service_account(namespace, account)
            .await
            .map_err(|e| start_failed(e.to_string()))?;
        if existing.is_none() {
            let object = ServiceAccount {
                metadata: ObjectMeta {
                    name: Some(account.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            match self.cluster.create_service_account(namespace, &object).await {
                Ok(_) => info!("Created service account {}/{}", namespace, account),
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(start_failed(e.to_string())),
            }
        }

        if let Some(secret) = &self.config.registry_secret {
            let found = self
                .cluster
                .get_secret(namespace, secret)
                .await
                .map_err(|e| start_failed(e.to_string()))?;
            if found.is_none() {
                return Err(start_failed(format!(
                    "registry secret {}/{} does not exist",
                    namespace, secret
                )));
            }
        }

        Ok(())
    }
}

/// Build context URL for kaniko's git support
fn git_context(clone_url: &str, version: &str) -> String {
    let repository = clone_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("git://");
    format!("git://{}#refs/tags/{}", repository, version)
}

/// Job manifest running kaniko for one service version
pub fn build_job(
    name: &str,
    service: &Service,
    clone_url: &str,
    image: &str,
    config: &BuildConfig,
) -> Result<Job, BuildError> {
    let mut manifest = serde_json::json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": name,
            "namespace": config.namespace,
            "labels": {
                "app": service.short_name,
                "version": service.version,
            },
        },
        "spec": {
            "backoffLimit": 0,
            "ttlSecondsAfterFinished": 300,
            "activeDeadlineSeconds": config.timeout_secs,
            "template": {
                "spec": {
                    "restartPolicy": "Never",
                    "serviceAccountName": config.service_account,
                    "containers": [{
                        "name": "kaniko",
                        "image": config.kaniko_image,
                        "args": [
                            format!("--dockerfile={}", service.build_file),
                            format!("--context={}", git_context(clone_url, &service.version)),
                            format!("--destination={}", image),
                        ],
                    }],
                },
            },
        },
    });

    if let Some(secret) = &config.registry_secret {
        let pod = &mut manifest["spec"]["template"]["spec"];
        pod["volumes"] = serde_json::json!([{
            "name": "docker-config",
            "secret": {
                "secretName": secret,
                "items": [{"key": ".dockerconfigjson", "path": "config.json"}],
            },
        }]);
        pod["containers"][0]["volumeMounts"] = serde_json::json!([{
            "name": "docker-config",
            "mountPath": "/kaniko/.docker",
        }]);
    }

    serde_json::from_value(manifest).map_err(|e| BuildError::StartFailed {
        name: name.to_string(),
        message: format!("invalid build job manifest: {}", e),
    })
}

/// Derive the build status from a Job's conditions
pub fn job_status(job: &Job) -> BuildStatus {
    let conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .cloned()
        .unwrap_or_default();

    for condition in conditions {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return BuildStatus::Succeeded,
            "Failed" => {
                return BuildStatus::Failed {
                    message: condition
                        .message
                        .or(condition.reason)
                        .unwrap_or_else(|| "build job failed".to_string()),
                }
            }
            _ => {}
        }
    }

    BuildStatus::Running
}

/// Poll a build Job until it completes, fails, or runs out of time
async fn watch_build(
    cluster: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    image: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<String, BuildError> {
    let start = Instant::now();
    loop {
        if start.elapsed() > timeout {
            return Err(BuildError::Timeout {
                name: name.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }

        tokio::time::sleep(poll_interval).await;

        match cluster.get_job(namespace, name).await {
            Ok(Some(job)) => match job_status(&job) {
                BuildStatus::Succeeded => return Ok(image.to_string()),
                BuildStatus::Failed { message } => {
                    return Err(BuildError::Failed {
                        name: name.to_string(),
                        message,
                    })
                }
                _ => debug!("Build {} still running", name),
            },
            Ok(None) => {
                return Err(BuildError::Failed {
                    name: name.to_string(),
                    message: "build job disappeared".to_string(),
                })
            }
            Err(e) => warn!("Failed to check build {}: {}", name, e),
        }
    }
}

#[async_trait]
impl ImageBuilder for KanikoBuilder {
    async fn build(&self, service: &Service) -> Result<PendingBuild, BuildError> {
        let clone_url = service
            .git_clone_url
            .as_deref()
            .ok_or_else(|| BuildError::MissingSource {
                service: service.reference().to_string(),
            })?;

        let name = naming::build_name(&service.short_name, &service.version).map_err(|e| {
            BuildError::StartFailed {
                name: service.reference().to_string(),
                message: e.to_string(),
            }
        })?;
        let image = self.config.image_for(&service.short_name, &service.version);
        let job = build_job(&name, service, clone_url, &image, &self.config)?;

        self.prepare(&name).await?;
        self.delete_existing_job(&name).await?;
        self.cluster
            .create_job(&self.config.namespace, &job)
            .await
            .map_err(|e| BuildError::StartFailed {
                name: name.clone(),
                message: e.to_string(),
            })?;

        info!("Started build {} for {}", name, image);

        let (mut sender, pending) = PendingBuild::channel(&name);
        let cluster = Arc::clone(&self.cluster);
        let namespace = self.config.namespace.clone();
        let timeout = self.config.timeout();
        let poll_interval = self.config.poll_interval();

        tokio::spawn(async move {
            let watch = watch_build(
                cluster.as_ref(),
                &namespace,
                &name,
                &image,
                timeout,
                poll_interval,
            );
            let result = tokio::select! {
                result = watch => result,
                _ = sender.closed() => {
                    // Nobody waits for the image anymore, e.g. the job was cancelled
                    info!("Build {} was abandoned, deleting its job", name);
                    match cluster.delete_job(&namespace, &name).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => warn!("Failed to delete abandoned build {}: {}", name, e),
                    }
                    return;
                }
            };

            if sender.send(result).is_err() {
                debug!("Nobody is waiting for build {} anymore", name);
            }
        });

        Ok(pending)
    }

    async fn get_build(&self, name: &str) -> Result<BuildStatus, BuildError> {
        let job = self
            .cluster
            .get_job(&self.config.namespace, name)
            .await
            .map_err(|e| BuildError::Failed {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        Ok(job.as_ref().map(job_status).unwrap_or(BuildStatus::NotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, FakeCluster};
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::api::core::v1::Secret;

    fn job_with_condition(type_: &str, status: &str) -> Job {
        Job {
            status: Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: type_.to_string(),
                    status: status.to_string(),
                    message: Some("exit code 1".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_job_status_from_conditions() {
        assert_eq!(job_status(&Job::default()), BuildStatus::Running);
        assert_eq!(
            job_status(&job_with_condition("Complete", "True")),
            BuildStatus::Succeeded
        );
        assert_eq!(
            job_status(&job_with_condition("Failed", "True")),
            BuildStatus::Failed {
                message: "exit code 1".to_string()
            }
        );
        assert_eq!(
            job_status(&job_with_condition("Complete", "False")),
            BuildStatus::Running
        );
    }

    #[test]
    fn test_build_job_manifest() {
        let service = Service::new("cart", "1.0.0").with_git("https://github.com/acme/cart.git");
        let config = BuildConfig::default();
        let job = build_job(
            "build-cart-1-0-0",
            &service,
            "https://github.com/acme/cart.git",
            "docker.io/marshal/cart:1.0.0",
            &config,
        )
        .unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("build-cart-1-0-0"));
        let spec = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let args = spec.containers[0].args.clone().unwrap();
        assert!(args.contains(&"--dockerfile=Dockerfile".to_string()));
        assert!(args.contains(&"--context=git://github.com/acme/cart.git#refs/tags/1.0.0".to_string()));
        assert!(args.contains(&"--destination=docker.io/marshal/cart:1.0.0".to_string()));
    }

    #[tokio::test]
    async fn test_pending_build_resolves() {
        let (sender, pending) = PendingBuild::channel("build-cart-1-0-0");
        assert_eq!(pending.name(), "build-cart-1-0-0");
        sender.send(Ok("registry/cart:1.0.0".to_string())).unwrap();
        assert_eq!(pending.wait().await.unwrap(), "registry/cart:1.0.0");
    }

    #[tokio::test]
    async fn test_dropped_sender_abandons_build() {
        let (sender, pending) = PendingBuild::channel("build-cart-1-0-0");
        drop(sender);
        assert!(matches!(
            pending.wait().await,
            Err(BuildError::Abandoned { .. })
        ));
    }

    #[test]
    fn test_registry_secret_is_mounted() {
        let service = Service::new("cart", "1.0.0");
        let config = BuildConfig {
            registry_secret: Some("registry-push".to_string()),
            ..BuildConfig::default()
        };
        let job = build_job("build-cart-1-0-0", &service, "git://x/cart", "img", &config).unwrap();

        let spec = job.spec.unwrap().template.spec.unwrap();
        let volumes = spec.volumes.clone().unwrap();
        let volume = &volumes[0];
        assert_eq!(
            volume.secret.as_ref().and_then(|s| s.secret_name.as_deref()),
            Some("registry-push")
        );
        let mount = &spec.containers[0].volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, "/kaniko/.docker");
    }

    #[tokio::test]
    async fn test_build_prepares_namespace_and_creates_job() {
        let cluster = Arc::new(FakeCluster::new());
        let builder = KanikoBuilder::new(cluster.clone(), BuildConfig::default());
        let service = Service::new("cart", "1.0.0").with_git("https://github.com/acme/cart.git");

        let pending = builder.build(&service).await.unwrap();
        assert_eq!(pending.name(), "build-cart-1-0-0");

        assert!(cluster.get_namespace("marshal-build-bot").await.unwrap().is_some());
        assert!(cluster
            .get_service_account("marshal-build-bot", "build-bot")
            .await
            .unwrap()
            .is_some());
        assert_eq!(
            builder.get_build("build-cart-1-0-0").await.unwrap(),
            BuildStatus::Running
        );

        // A second build of the same version replaces the Job
        assert!(builder.build(&service).await.is_ok());
    }

    #[tokio::test]
    async fn test_build_refused_without_source_or_secret() {
        let cluster = Arc::new(FakeCluster::new());
        let builder = KanikoBuilder::new(cluster.clone(), BuildConfig::default());
        assert!(matches!(
            builder.build(&Service::new("cart", "1.0.0")).await,
            Err(BuildError::MissingSource { .. })
        ));

        let config = BuildConfig {
            registry_secret: Some("registry-push".to_string()),
            ..BuildConfig::default()
        };
        let builder = KanikoBuilder::new(cluster, config);
        let service = Service::new("cart", "1.0.0").with_git("https://github.com/acme/cart.git");
        let err = builder.build(&service).await.unwrap_err();
        assert!(err.to_string().contains("registry-push"));
    }

    #[tokio::test]
    async fn test_abandoned_build_deletes_its_job() {
        let cluster = Arc::new(FakeCluster::new());
        let config = BuildConfig {
            poll_interval_secs: 3600,
            ..BuildConfig::default()
        };
        let builder = KanikoBuilder::new(cluster.clone(), config);
        let service = Service::new("cart", "1.0.0").with_git("https://github.com/acme/cart.git");

        let pending = builder.build(&service).await.unwrap();
        assert_eq!(
            builder.get_build("build-cart-1-0-0").await.unwrap(),
            BuildStatus::Running
        );

        // The watcher stops without waiting for its next poll
        drop(pending);
        eventually(|| async {
            builder.get_build("build-cart-1-0-0").await.unwrap() == BuildStatus::NotFound
        })
        .await;
    }

    #[tokio::test]
    async fn test_build_starts_with_existing_registry_secret() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_secret(
            "marshal-build-bot",
            Secret {
                metadata: ObjectMeta {
                    name: Some("registry-push".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let config = BuildConfig {
            registry_secret: Some("registry-push".to_string()),
            ..BuildConfig::default()
        };
        let builder = KanikoBuilder::new(cluster.clone(), config);
        let service = Service::new("cart", "1.0.0").with_git("https://github.com/acme/cart.git");

        builder.build(&service).await.unwrap();
        let job = cluster
            .get_job("marshal-build-bot", "build-cart-1-0-0")
            .await
            .unwrap()
            .unwrap();
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.volumes.map(|v| v.len()), Some(1));
    }
}

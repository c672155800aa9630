//! Deployment orchestrator
//!
//! For each service instance of an application: optionally build the image,
//! then reconcile the Deployment and one Service per interface, then record
//! the actual state. Every instance runs as its own background job, so a
//! failed build of one service never holds back the others.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::domain::{
    Application, ApplicationJobStatus, BackgroundJob, DeploymentStatusValue, JobType,
    KubernetesDeploymentInfo, Service, ServiceDeploymentInfo, TopicRoleKind,
};
use crate::error::{BuildError, JobError, KubernetesResourceError, OrchestratorError, StoreError};
use crate::infrastructure::builder::ImageBuilder;
use crate::infrastructure::store::StateStore;
use crate::services::job_tracker::{CancelToken, JobTracker};
use crate::services::reconciler::Reconciler;

/// Why a pipeline stopped before finishing
#[derive(Debug, Error)]
enum PipelineError {
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Kubernetes(#[from] KubernetesResourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Job(#[from] JobError),
}

fn store_error(err: StoreError) -> OrchestratorError {
    match err {
        StoreError::NotFound(not_found) => OrchestratorError::NotFound(not_found),
        other => OrchestratorError::Store(other),
    }
}

/// Collaborators shared by the orchestrator and every pipeline it spawns
#[derive(Clone)]
struct Pipeline {
    store: Arc<dyn StateStore>,
    builder: Arc<dyn ImageBuilder>,
    reconciler: Arc<Reconciler>,
    jobs: Arc<JobTracker>,
}

impl Pipeline {
    /// Drive one job to a terminal state
    async fn run(
        self,
        job: BackgroundJob,
        token: CancelToken,
        service: Service,
        info: ServiceDeploymentInfo,
    ) {
        let job_id = job.id.clone();
        let outcome = match self.execute(&job, &token, service, &info).await {
            Ok(image) => self.jobs.mark_done(&job_id, image).await,
            Err(PipelineError::Cancelled) => {
                info!(
                    job_id = %job_id,
                    instance_id = %info.instance_id,
                    "Pipeline stopped after cancellation"
                );
                return;
            }
            Err(e) => {
                error!(
                    job_id = %job_id,
                    instance_id = %info.instance_id,
                    "{} job failed: {}", job.job_type, e
                );
                self.jobs.mark_error(&job_id, e.to_string()).await
            }
        };

        // Loses only to a concurrent cancel, which already recorded the outcome
        if let Err(e) = outcome {
            debug!(job_id = %job_id, "Could not record job outcome: {}", e);
        }
    }

    /// Stop once the job is cancelled, by this process or by another one
    /// sharing the job store
    async fn check_cancelled(
        &self,
        job: &BackgroundJob,
        token: &CancelToken,
    ) -> Result<(), PipelineError> {
        if token.is_cancelled() || !self.jobs.is_in_flight(&job.id).await? {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    /// Returns the image produced by a build, if one ran
    async fn execute(
        &self,
        job: &BackgroundJob,
        token: &CancelToken,
        mut service: Service,
        info: &ServiceDeploymentInfo,
    ) -> Result<Option<String>, PipelineError> {
        let image = match job.job_type {
            JobType::Build => {
                let pending = self.builder.build(&service).await?;
                self.check_cancelled(job, token).await?;
                self.jobs.mark_running(&job.id).await?;
                info!(job_id = %job.id, "Waiting for build {}", pending.name());

                let image = tokio::select! {
                    result = pending.wait() => result?,
                    _ = token.cancelled() => return Err(PipelineError::Cancelled),
                };
                info!(job_id = %job.id, "Built image {}", image);

                self.store
                    .update_service_image(&service.short_name, &service.version, &image)
                    .await?;
                service.image = Some(image.clone());
                Some(image)
            }
            _ => {
                self.check_cancelled(job, token).await?;
                self.jobs.mark_running(&job.id).await?;
                None
            }
        };

        self.check_cancelled(job, token).await?;
        let deployment = self.reconciler.reconcile_service(&service, info).await?;

        let mut service_names = Vec::with_capacity(service.interfaces.len());
        for interface in &service.interfaces {
            self.check_cancelled(job, token).await?;
            let k8s_service = self
                .reconciler
                .reconcile_interface(&service, interface, info)
                .await?;
            service_names.push(k8s_service.metadata.name.unwrap_or_default());
        }

        let record = KubernetesDeploymentInfo {
            namespace: deployment
                .metadata
                .namespace
                .unwrap_or_else(|| self.reconciler.namespace().to_string()),
            deployment_name: deployment.metadata.name.unwrap_or_default(),
            service_names,
        };
        self.store
            .update_kubernetes_deployment_info(&info.instance_id, Some(record))
            .await?;

        Ok(image)
    }
}

/// Composes builds, reconciliation and job tracking into application
/// deployments
pub struct Orchestrator {
    pipeline: Pipeline,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        builder: Arc<dyn ImageBuilder>,
        reconciler: Arc<Reconciler>,
        jobs: Arc<JobTracker>,
    ) -> Self {
        Self {
            pipeline: Pipeline {
                store,
                builder,
                reconciler,
                jobs,
            },
        }
    }

    pub fn jobs(&self) -> &JobTracker {
        &self.pipeline.jobs
    }

    /// Load the services of an application and check every instance can be
    /// deployed
    async fn deployable_instances(
        &self,
        application: &Application,
    ) -> Result<Vec<(Service, ServiceDeploymentInfo)>, OrchestratorError> {
        let mut instances = Vec::with_capacity(application.services.len());

        for info in &application.services {
            let service = self
                .pipeline
                .store
                .get_service(&info.service.short_name, &info.service.version)
                .await
                .map_err(store_error)?;

            if !service.kafka_enabled && service.interfaces.is_empty() {
                return Err(OrchestratorError::NoInterfaces {
                    short_name: service.short_name,
                    version: service.version,
                });
            }
            if !info.has_instance_id() {
                return Err(OrchestratorError::NotDeployable {
                    instance_id: info.service.to_string(),
                    reason: "no instance id has been assigned".to_string(),
                });
            }
            if service.kafka_enabled && info.topic(TopicRoleKind::Input).is_none() {
                return Err(OrchestratorError::NotDeployable {
                    instance_id: info.instance_id.clone(),
                    reason: "Kafka-enabled service has no input topic".to_string(),
                });
            }

            instances.push((service, info.clone()));
        }

        Ok(instances)
    }

    /// Start a background job per service instance of an application
    ///
    /// Returns once every job is registered, with the application's job status
    /// at that moment. Instances that already have a job in flight are skipped.
    pub async fn deploy_application(
        &self,
        short_name: &str,
        version: &str,
        rebuild: bool,
    ) -> Result<ApplicationJobStatus, OrchestratorError> {
        let application = self
            .pipeline
            .store
            .get_application(short_name, version)
            .await
            .map_err(store_error)?;
        let instances = self.deployable_instances(&application).await?;

        info!(
            "Deploying {} ({} service instances, rebuild: {})",
            application,
            instances.len(),
            rebuild
        );

        for (service, info) in instances {
            let job_type = if rebuild || service.image.is_none() {
                JobType::Build
            } else {
                JobType::Deploy
            };
            let job = BackgroundJob::new(
                job_type,
                &service.reference(),
                &info.instance_id,
                short_name,
                version,
            );

            let (job, token) = match self.pipeline.jobs.register(job).await {
                Ok(registered) => registered,
                Err(JobError::AlreadyInFlight { instance_id, job_id }) => {
                    warn!(
                        instance_id = %instance_id,
                        "Skipping instance, job {} is still in flight", job_id
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            tokio::spawn(self.pipeline.clone().run(job, token, service, info));
        }

        Ok(self
            .pipeline
            .jobs
            .get_job_status_for_application(short_name, version)
            .await?)
    }

    /// Job status of an application: the folded status plus every job
    pub async fn get_job_status_for_application(
        &self,
        application: &Application,
    ) -> Result<ApplicationJobStatus, OrchestratorError> {
        Ok(self
            .pipeline
            .jobs
            .get_job_status_for_application(&application.short_name, &application.version)
            .await?)
    }

    /// Remove the Kubernetes resources of every instance of an application
    ///
    /// Each instance is tracked as an UNDEPLOY job. Refused while the
    /// application is still deploying; a no-op when nothing is deployed.
    pub async fn undeploy_application(
        &self,
        short_name: &str,
        version: &str,
    ) -> Result<ApplicationJobStatus, OrchestratorError> {
        let application = self
            .pipeline
            .store
            .get_application(short_name, version)
            .await
            .map_err(store_error)?;
        let jobs = &self.pipeline.jobs;

        if jobs.has_in_flight_jobs(short_name, version).await? {
            return Err(OrchestratorError::ApplicationIsDeploying {
                short_name: short_name.to_string(),
                version: version.to_string(),
            });
        }

        let status = self
            .pipeline
            .reconciler
            .application_deployment_status(&application)
            .await;
        match status.value {
            DeploymentStatusValue::Pending => {
                return Err(OrchestratorError::ApplicationIsDeploying {
                    short_name: short_name.to_string(),
                    version: version.to_string(),
                })
            }
            DeploymentStatusValue::Undeployed => {
                info!("{} is not deployed, nothing to undeploy", application);
                return Ok(jobs.get_job_status_for_application(short_name, version).await?);
            }
            other => info!("Undeploying {} (currently {})", application, other),
        }

        for info in &application.services {
            let job = BackgroundJob::new(
                JobType::Undeploy,
                &info.service,
                &info.instance_id,
                short_name,
                version,
            );
            let (job, _token) = jobs.register(job).await?;
            jobs.mark_running(&job.id).await?;

            let result = async {
                self.pipeline.reconciler.undeploy_instance(info).await?;
                self.pipeline
                    .store
                    .update_kubernetes_deployment_info(&info.instance_id, None)
                    .await?;
                Ok::<(), PipelineError>(())
            }
            .await;

            match result {
                Ok(()) => {
                    jobs.mark_done(&job.id, None).await?;
                }
                Err(e) => {
                    error!(instance_id = %info.instance_id, "Undeploy failed: {}", e);
                    jobs.mark_error(&job.id, e.to_string()).await?;
                }
            }
        }

        Ok(jobs.get_job_status_for_application(short_name, version).await?)
    }

    /// Application by identity, for callers that only hold the names
    pub async fn get_application(
        &self,
        short_name: &str,
        version: &str,
    ) -> Result<Application, OrchestratorError> {
        self.pipeline
            .store
            .get_application(short_name, version)
            .await
            .map_err(store_error)
    }
}

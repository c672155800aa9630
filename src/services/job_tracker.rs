//! Background job tracker
//!
//! Records every unit of background work with its status, enforces the
//! job state machine, and hands each job a [`CancelToken`] so the task
//! running it can stop cooperatively.
//!
//! At most one job per instance id is in flight: registration checks and
//! inserts in one atomic store update, which also holds across processes
//! sharing a job file.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::domain::{ApplicationJobStatus, BackgroundJob, JobStatus, JobType};
use crate::error::{JobError, NotFoundError};
use crate::infrastructure::store::JobStore;

/// Cooperative cancellation signal of one job
#[derive(Clone, Debug)]
pub struct CancelToken {
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the job is cancelled; never resolves otherwise
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            // The job finished and dropped its sender
            std::future::pending::<()>().await;
        }
    }
}

/// Tracks background jobs and their cancellation handles
pub struct JobTracker {
    store: Arc<dyn JobStore>,
    /// Cancel senders of in-flight jobs started by this process
    in_flight: Mutex<HashMap<String, watch::Sender<bool>>>,
    retention: Duration,
}

impl JobTracker {
    pub fn new(store: Arc<dyn JobStore>, retention: Duration) -> Self {
        Self {
            store,
            in_flight: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Record a new PENDING job
    ///
    /// Fails with [`JobError::AlreadyInFlight`] if the job's instance already
    /// has a PENDING or RUNNING job. A finished job of the same instance and
    /// type is replaced.
    pub async fn register(&self, job: BackgroundJob) -> Result<(BackgroundJob, CancelToken), JobError> {
        let mut in_flight = self.in_flight.lock().await;
        let now = Utc::now();
        let retention = self.retention;

        let mut refused = None;
        self.store
            .update(&mut |jobs| {
                purge_expired_jobs(jobs, now, retention);
                if let Some(active) = jobs
                    .iter()
                    .find(|j| j.instance_id == job.instance_id && j.status.is_in_flight())
                {
                    refused = Some(active.id.clone());
                    return;
                }
                jobs.retain(|previous| {
                    let replaced = previous.instance_id == job.instance_id
                        && previous.job_type == job.job_type;
                    if replaced {
                        debug!("Replacing finished job {}", previous.id);
                    }
                    !replaced
                });
                jobs.push(job.clone());
            })
            .await?;

        if let Some(job_id) = refused {
            return Err(JobError::AlreadyInFlight {
                instance_id: job.instance_id.clone(),
                job_id,
            });
        }

        let (sender, receiver) = watch::channel(false);
        in_flight.insert(job.id.clone(), sender);

        info!(
            job_id = %job.id,
            instance_id = %job.instance_id,
            "Registered {} job", job.job_type
        );
        Ok((job, CancelToken { receiver }))
    }

    async fn transition(
        &self,
        id: &str,
        next: JobStatus,
        mut error_message: Option<String>,
        mut image: Option<String>,
    ) -> Result<BackgroundJob, JobError> {
        let mut in_flight = self.in_flight.lock().await;
        let now = Utc::now();

        let mut outcome = Err(JobError::from(NotFoundError::Job { id: id.to_string() }));
        let mut recorded = None;
        self.store
            .update(&mut |jobs| {
                let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
                    return;
                };
                recorded = Some(job.status);
                if !job.status.can_transition_to(next) {
                    outcome = Err(JobError::InvalidTransition {
                        id: id.to_string(),
                        from: job.status.to_string(),
                        to: next.to_string(),
                    });
                    return;
                }

                job.status = next;
                job.updated_at = now;
                if let Some(message) = error_message.take() {
                    job.error_message = Some(message);
                }
                if let Some(image) = image.take() {
                    job.image = Some(image);
                }
                outcome = Ok(job.clone());
            })
            .await?;

        let finished = match &outcome {
            Ok(job) => job.status.is_terminal(),
            Err(_) => recorded.is_some_and(|status| status.is_terminal()),
        };
        if finished {
            if let Some(sender) = in_flight.remove(id) {
                // Cancelled elsewhere, e.g. by another process sharing the store
                if recorded == Some(JobStatus::Cancelled) {
                    let _ = sender.send(true);
                }
            }
        }

        let job = outcome?;
        debug!(job_id = %id, "Job is now {}", next);
        Ok(job)
    }

    pub async fn mark_running(&self, id: &str) -> Result<BackgroundJob, JobError> {
        self.transition(id, JobStatus::Running, None, None).await
    }

    pub async fn mark_done(&self, id: &str, image: Option<String>) -> Result<BackgroundJob, JobError> {
        self.transition(id, JobStatus::Done, None, image).await
    }

    pub async fn mark_error(&self, id: &str, message: impl Into<String>) -> Result<BackgroundJob, JobError> {
        self.transition(id, JobStatus::Error, Some(message.into()), None)
            .await
    }

    /// Cancel an in-flight job; `Ok(false)` if it had already finished
    pub async fn cancel(&self, id: &str) -> Result<bool, JobError> {
        let mut in_flight = self.in_flight.lock().await;
        let now = Utc::now();

        let mut outcome = Err(JobError::from(NotFoundError::Job { id: id.to_string() }));
        self.store
            .update(&mut |jobs| {
                outcome = match jobs.iter_mut().find(|j| j.id == id) {
                    None => return,
                    Some(job) if job.status.is_terminal() => {
                        debug!(job_id = %id, "Job already finished as {}", job.status);
                        Ok(false)
                    }
                    Some(job) => {
                        job.status = JobStatus::Cancelled;
                        job.updated_at = now;
                        Ok(true)
                    }
                };
            })
            .await?;

        let cancelled = outcome?;
        if let Some(sender) = in_flight.remove(id) {
            if cancelled {
                let _ = sender.send(true);
            }
        }
        if cancelled {
            info!(job_id = %id, "Cancelled job");
        }
        Ok(cancelled)
    }

    /// True unless the job's record has left PENDING and RUNNING
    ///
    /// Unlike [`CancelToken`], this also observes cancellation recorded by
    /// another process.
    pub async fn is_in_flight(&self, id: &str) -> Result<bool, JobError> {
        Ok(self.get_job_by_id(id).await?.status.is_in_flight())
    }

    pub async fn get_job_by_id(&self, id: &str) -> Result<BackgroundJob, JobError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| NotFoundError::Job { id: id.to_string() }.into())
    }

    pub async fn get_all_jobs(&self) -> Result<Vec<BackgroundJob>, JobError> {
        Ok(self.store.list().await?)
    }

    #[allow(dead_code)]
    pub async fn get_job_by_instance_id_and_type(
        &self,
        instance_id: &str,
        job_type: JobType,
    ) -> Result<Option<BackgroundJob>, JobError> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .find(|j| j.instance_id == instance_id && j.job_type == job_type))
    }

    pub async fn get_jobs_for_service(
        &self,
        short_name: &str,
        version: &str,
    ) -> Result<Vec<BackgroundJob>, JobError> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|j| j.targets_service(short_name, version))
            .collect())
    }

    pub async fn get_jobs_for_application(
        &self,
        short_name: &str,
        version: &str,
    ) -> Result<Vec<BackgroundJob>, JobError> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|j| j.belongs_to_application(short_name, version))
            .collect())
    }

    /// Folded job status of an application plus its jobs
    pub async fn get_job_status_for_application(
        &self,
        short_name: &str,
        version: &str,
    ) -> Result<ApplicationJobStatus, JobError> {
        let jobs = self.get_jobs_for_application(short_name, version).await?;
        Ok(ApplicationJobStatus::from_jobs(jobs))
    }

    /// True if any job of the application is PENDING or RUNNING
    pub async fn has_in_flight_jobs(&self, short_name: &str, version: &str) -> Result<bool, JobError> {
        Ok(self
            .get_jobs_for_application(short_name, version)
            .await?
            .iter()
            .any(|j| j.status.is_in_flight()))
    }

    /// Cancel the job if it is in flight, then remove its record
    pub async fn delete_job(&self, id: &str) -> Result<(), JobError> {
        self.cancel(id).await?;
        let _in_flight = self.in_flight.lock().await;
        self.store
            .update(&mut |jobs| jobs.retain(|j| j.id != id))
            .await?;
        info!(job_id = %id, "Deleted job");
        Ok(())
    }

    pub async fn delete_all_jobs(&self) -> Result<usize, JobError> {
        let jobs = self.store.list().await?;
        for job in &jobs {
            self.delete_job(&job.id).await?;
        }
        Ok(jobs.len())
    }

    /// Remove finished jobs older than the retention window
    pub async fn purge_expired(&self) -> Result<usize, JobError> {
        let _in_flight = self.in_flight.lock().await;
        let now = Utc::now();
        let mut purged = 0;
        self.store
            .update(&mut |jobs| purged = purge_expired_jobs(jobs, now, self.retention))
            .await?;
        Ok(purged)
    }
}

fn purge_expired_jobs(jobs: &mut Vec<BackgroundJob>, now: DateTime<Utc>, retention: Duration) -> usize {
    let before = jobs.len();
    jobs.retain(|job| {
        let expired = (now - job.updated_at)
            .to_std()
            .map(|age| age >= retention)
            .unwrap_or(false);
        !(job.status.is_terminal() && expired)
    });
    let purged = before - jobs.len();
    if purged > 0 {
        debug!("Purged {} expired jobs", purged);
    }
    purged
}

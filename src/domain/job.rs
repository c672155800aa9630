//! Background job records and their status state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::service::ServiceRef;

/// Kind of work a background job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Build the image, then reconcile
    Build,
    /// Reconcile only
    Deploy,
    Undeploy,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Build => "BUILD",
            Self::Deploy => "DEPLOY",
            Self::Undeploy => "UNDEPLOY",
        };
        write!(f, "{}", s)
    }
}

/// Job status
///
/// ```text
/// PENDING -> RUNNING -> {DONE, ERROR}
/// PENDING -> ERROR
/// PENDING | RUNNING -> CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
    Cancelled,
}

impl JobStatus {
    /// DONE, ERROR and CANCELLED never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Error)
                | (Pending, Cancelled)
                | (Running, Done)
                | (Running, Error)
                | (Running, Cancelled)
        )
    }

    /// Rank used when folding many jobs into one status; higher wins
    fn precedence(&self) -> u8 {
        match self {
            Self::Error => 4,
            Self::Running => 3,
            Self::Pending => 2,
            Self::Cancelled => 1,
            Self::Done => 0,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// Fold job statuses into one: the worst or most in-progress status wins
pub fn aggregate_status<I>(statuses: I) -> Option<JobStatus>
where
    I: IntoIterator<Item = JobStatus>,
{
    statuses.into_iter().max_by_key(|s| s.precedence())
}

/// Persisted record of one unit of background work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundJob {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub service_short_name: String,
    pub service_version: String,
    pub instance_id: String,
    pub application_short_name: String,
    pub application_version: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Image reference produced by a build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackgroundJob {
    /// New PENDING job for one service instance of an application
    pub fn new(
        job_type: JobType,
        service: &ServiceRef,
        instance_id: impl Into<String>,
        application_short_name: impl Into<String>,
        application_version: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            job_type,
            service_short_name: service.short_name.clone(),
            service_version: service.version.clone(),
            instance_id: instance_id.into(),
            application_short_name: application_short_name.into(),
            application_version: application_version.into(),
            status: JobStatus::Pending,
            error_message: None,
            image: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn belongs_to_application(&self, short_name: &str, version: &str) -> bool {
        self.application_short_name == short_name && self.application_version == version
    }

    pub fn targets_service(&self, short_name: &str, version: &str) -> bool {
        self.service_short_name == short_name && self.service_version == version
    }
}

/// Job status of one application: the folded status plus every job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationJobStatus {
    pub status: Option<JobStatus>,
    pub jobs: Vec<BackgroundJob>,
}

impl ApplicationJobStatus {
    pub fn from_jobs(jobs: Vec<BackgroundJob>) -> Self {
        Self {
            status: aggregate_status(jobs.iter().map(|j| j.status)),
            jobs,
        }
    }
}

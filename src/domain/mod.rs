//! Domain layer - pure business logic
//!
//! This module contains business logic with no external I/O.
//! Types and functions here can be unit tested without mocking.

pub mod application;
pub mod job;
pub mod naming;
pub mod service;
pub mod status;

// Re-export commonly used types
pub use application::{
    Application, EnvironmentVariable, KubernetesDeploymentInfo, ServiceDeploymentInfo,
    TopicRoleKind,
};
pub use job::{ApplicationJobStatus, BackgroundJob, JobStatus, JobType};
pub use service::{Service, ServiceInterface, ServicePort, ServiceRef};
pub use status::{
    ApplicationDeploymentStatus, ApplicationStatus, DeploymentStatusValue, InterfaceStatus,
    MessageType, PodInfo, PodMetrics, ServiceStatus,
};

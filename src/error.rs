//! Centralized error types for marshal
//!
//! Uses thiserror for typed errors that can be matched on,
//! while still being compatible with anyhow for propagation.

use thiserror::Error;

/// Errors raised by the cluster access facade
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("{kind} {name} already exists in namespace {namespace}")]
    AlreadyExists {
        kind: String,
        name: String,
        namespace: String,
    },

    #[error("{kind} {name} not found in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    #[error("Kubernetes API call '{operation}' failed: {message}")]
    Api { operation: String, message: String },
}

impl ClusterError {
    pub fn api(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Api {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Kubernetes resource errors raised by the reconciler
#[derive(Error, Debug)]
pub enum KubernetesResourceError {
    #[error("Kubernetes resource lookup failed for {kind} with labels {selector}: {source}")]
    Lookup {
        kind: &'static str,
        selector: String,
        #[source]
        source: ClusterError,
    },

    #[error("Failed to create {kind} {name}: {source}")]
    Create {
        kind: &'static str,
        name: String,
        #[source]
        source: ClusterError,
    },

    #[error("Failed to delete {kind} {name}: {source}")]
    Delete {
        kind: &'static str,
        name: String,
        #[source]
        source: ClusterError,
    },

    #[error("Found {count} {kind}s matching labels {selector}, expected at most one")]
    Duplicate {
        kind: &'static str,
        selector: String,
        count: usize,
    },

    #[error("Service {service} has no container image, build it first")]
    MissingImage { service: String },

    #[error("Interface {interface} of service {service} has no ports")]
    NoPorts { service: String, interface: String },

    #[error("Invalid Kubernetes name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
}

/// Image build errors
#[derive(Error, Debug, Clone)]
pub enum BuildError {
    #[error("Service {service} has no git clone URL")]
    MissingSource { service: String },

    #[error("Build {name} could not be started: {message}")]
    StartFailed { name: String, message: String },

    #[error("Build {name} failed: {message}")]
    Failed { name: String, message: String },

    #[error("Build {name} timed out after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },

    #[error("Build {name} was abandoned before it reported a result")]
    Abandoned { name: String },
}

/// Missing entities, distinguishable from transient faults
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotFoundError {
    #[error("Application {short_name} {version} not found")]
    Application { short_name: String, version: String },

    #[error("Service {short_name} {version} not found")]
    Service { short_name: String, version: String },

    #[error("Service deployment with instance id {instance_id} not found")]
    Instance { instance_id: String },

    #[error("Job {id} not found")]
    Job { id: String },
}

/// Background job tracker errors
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Instance {instance_id} already has job {job_id} in flight")]
    AlreadyInFlight { instance_id: String, job_id: String },

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error("Job store error: {0}")]
    Store(String),
}

/// Metrics backend errors
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metrics request failed: {0}")]
    Request(String),

    #[error("Metrics backend answered with HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("Metrics query was not successful (status: {status})")]
    Unsuccessful { status: String },

    #[error("Metrics query returned no samples")]
    Empty,

    #[error("Metrics value could not be parsed: {0}")]
    Parse(String),
}

/// Desired-state store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error("Failed to read state file {path}: {message}")]
    Read { path: String, message: String },

    #[error("Failed to write state file {path}: {message}")]
    Write { path: String, message: String },

    #[error("Failed to parse state: {message}")]
    Parse { message: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    #[error("Failed to read config {path}: {message}")]
    Read { path: String, message: String },

    #[error("Failed to parse config: {message}")]
    ParseError { message: String },
}

/// Synchronous failures of the deployment orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error("Service {short_name} {version} has no interfaces and is not Kafka-enabled")]
    NoInterfaces { short_name: String, version: String },

    #[error("Service instance {instance_id} is not deployable: {reason}")]
    NotDeployable { instance_id: String, reason: String },

    #[error("Application {short_name} {version} is currently deploying")]
    ApplicationIsDeploying { short_name: String, version: String },

    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] KubernetesResourceError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        JobError::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinct_from_transient() {
        let err: OrchestratorError = NotFoundError::Application {
            short_name: "shop".to_string(),
            version: "1.0.0".to_string(),
        }
        .into();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
        assert_eq!(err.to_string(), "Application shop 1.0.0 not found");
    }

    #[test]
    fn test_kubernetes_resource_error_display() {
        let err = KubernetesResourceError::Lookup {
            kind: "Deployment",
            selector: "app=cart".to_string(),
            source: ClusterError::api("list deployments", "connection refused"),
        };
        let message = err.to_string();
        assert!(message.starts_with("Kubernetes resource lookup failed"));
        assert!(message.contains("connection refused"));
    }

    #[test]
    fn test_cluster_error_predicates() {
        let err = ClusterError::AlreadyExists {
            kind: "Deployment".to_string(),
            name: "cart-1a2b".to_string(),
            namespace: "apps".to_string(),
        };
        assert!(err.is_already_exists());
        assert!(!err.is_not_found());
    }
}

//! Infrastructure layer - external I/O adapters
//!
//! This module contains all code that interacts with external systems:
//! - Kubernetes API (cluster access facade)
//! - Image builds (kaniko Jobs)
//! - Prometheus
//! - Desired-state and job stores

pub mod builder;
pub mod cluster;
pub mod metrics;
pub mod store;

// Re-export commonly used types
pub use builder::KanikoBuilder;
pub use cluster::KubeCluster;
pub use metrics::PrometheusClient;
pub use store::{FileJobStore, FileStateStore, StateStore};

//! Command implementations
//!
//! Each command wires the control plane from the global options, runs one
//! operation, and renders the result as text or JSON.

pub mod deploy;
pub mod jobs;
pub mod status;
pub mod undeploy;

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::cli::OutputFormat;
use crate::config::ControlPlaneConfig;
use crate::infrastructure::{FileJobStore, FileStateStore, KanikoBuilder, KubeCluster, PrometheusClient};
use crate::services::{JobTracker, Orchestrator, Reconciler, StatusAggregator};

/// Options shared by every command
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub state: PathBuf,
    pub jobs_file: PathBuf,
}

impl GlobalOptions {
    pub fn load_config(&self) -> Result<ControlPlaneConfig> {
        ControlPlaneConfig::load(self.config.as_deref()).context("Failed to load configuration")
    }

    /// Job tracker over the job file; needs no cluster access
    pub async fn job_tracker(&self, config: &ControlPlaneConfig) -> Result<Arc<JobTracker>> {
        let store = FileJobStore::open(&self.jobs_file)
            .await
            .with_context(|| format!("Failed to open job file {}", self.jobs_file.display()))?;
        Ok(Arc::new(JobTracker::new(
            Arc::new(store),
            config.jobs.retention(),
        )))
    }
}

/// Every component of the control plane, wired for one command run
pub struct ControlPlane {
    pub store: Arc<FileStateStore>,
    pub orchestrator: Orchestrator,
    pub status: StatusAggregator,
}

impl ControlPlane {
    pub async fn connect(options: &GlobalOptions) -> Result<Self> {
        let config = options.load_config()?;
        debug!("Workspace namespace: {}", config.kubernetes.namespace);

        let store = Arc::new(
            FileStateStore::open(&options.state)
                .await
                .with_context(|| format!("Failed to open state file {}", options.state.display()))?,
        );
        let jobs = options.job_tracker(&config).await?;

        let cluster = Arc::new(
            KubeCluster::infer()
                .await
                .context("Failed to connect to Kubernetes")?,
        );
        let reconciler = Arc::new(Reconciler::new(cluster.clone(), config.kubernetes.clone()));
        let builder = Arc::new(KanikoBuilder::new(cluster, config.build.clone()));
        let metrics = Arc::new(
            PrometheusClient::new(&config.metrics).context("Failed to create metrics client")?,
        );

        let orchestrator = Orchestrator::new(store.clone(), builder, reconciler.clone(), jobs);
        let status = StatusAggregator::new(reconciler, metrics, store.clone());

        Ok(Self {
            store,
            orchestrator,
            status,
        })
    }
}

/// Print a value as pretty JSON
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}

/// Render with `text` unless JSON output was requested
pub fn render<T: Serialize>(output: OutputFormat, value: &T, text: impl FnOnce(&T)) -> Result<()> {
    match output {
        OutputFormat::Json => print_json(value),
        OutputFormat::Text => {
            text(value);
            Ok(())
        }
    }
}

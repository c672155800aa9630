//! CLI definitions for marshal
//!
//! This module contains all CLI argument parsing structures using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "marshal",
    version,
    about = "Control plane that builds and deploys versioned applications onto Kubernetes",
    long_about = "Builds service images, reconciles Deployments and Services for every service\ninstance of an application, and reports their live status."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Control plane configuration file (YAML); missing file means defaults
    #[arg(long, global = true, env = "MARSHAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Desired-state file holding services and applications
    #[arg(long, global = true, env = "MARSHAL_STATE", default_value = "marshal-state.yaml")]
    pub state: PathBuf,

    /// Background job records
    #[arg(long, global = true, env = "MARSHAL_JOBS", default_value = "marshal-jobs.yaml")]
    pub jobs_file: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build (if needed) and deploy every service instance of an application
    Deploy {
        /// Application short name
        application: String,

        /// Application version
        version: String,

        /// Rebuild images even if one is already recorded
        #[arg(long)]
        rebuild: bool,

        /// How long to wait for the jobs before cancelling them (e.g. 10m, 90s)
        #[arg(long, default_value = "15m")]
        timeout: String,

        /// Interval between job status checks
        #[arg(long, default_value = "2s")]
        interval: String,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Remove the Kubernetes resources of an application
    Undeploy {
        /// Application short name
        application: String,

        /// Application version
        version: String,
    },

    /// Deployment status and live status of an application
    Status {
        /// Application short name
        application: String,

        /// Application version
        version: String,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Live status of one service version across its instances
    ServiceStatus {
        /// Service short name
        service: String,

        /// Service version
        version: String,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Inspect and manage background jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommands,
    },
}

#[derive(Subcommand)]
pub enum JobsCommands {
    /// List jobs, optionally only those of one application or one service
    List {
        /// Application short name
        #[arg(long = "app", requires = "version", conflicts_with = "service")]
        application: Option<String>,

        /// Application version
        #[arg(long = "app-version", requires = "application")]
        version: Option<String>,

        /// Service short name
        #[arg(long, requires = "service_version")]
        service: Option<String>,

        /// Service version
        #[arg(long = "service-version", requires = "service")]
        service_version: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Show one job
    Show {
        /// Job id
        id: String,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Cancel a pending or running job
    Cancel {
        /// Job id
        id: String,
    },

    /// Cancel (if needed) and delete one job, or all jobs
    Delete {
        /// Job id
        #[arg(required_unless_present = "all")]
        id: Option<String>,

        /// Delete every job
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },

    /// Remove finished jobs older than the retention window
    Purge,
}

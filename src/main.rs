use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod config;
mod domain;
mod error;
mod infrastructure;
mod services;
mod ui;

#[cfg(test)]
mod testing;

use cli::{Cli, Commands};
use commands::{deploy, jobs, status, undeploy, GlobalOptions};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // LOGGING=debug or LOG_LEVEL=marshal=debug,kube=warn
    let log_level = std::env::var("LOGGING")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| {
            if cli.verbose {
                "debug".to_string()
            } else {
                "info".to_string()
            }
        });

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(false)
        .init();

    let options = GlobalOptions {
        config: cli.config,
        state: cli.state,
        jobs_file: cli.jobs_file,
    };

    match cli.command {
        Commands::Deploy {
            application,
            version,
            rebuild,
            timeout,
            interval,
            output,
        } => {
            deploy::execute(
                &options,
                application,
                version,
                rebuild,
                timeout,
                interval,
                output,
            )
            .await
        }
        Commands::Undeploy {
            application,
            version,
        } => undeploy::execute(&options, application, version).await,
        Commands::Status {
            application,
            version,
            output,
        } => status::execute_application(&options, application, version, output).await,
        Commands::ServiceStatus {
            service,
            version,
            output,
        } => status::execute_service(&options, service, version, output).await,
        Commands::Jobs { command } => jobs::execute(&options, command).await,
    }
}

//! Job commands: list, show, cancel, delete and purge background jobs

use anyhow::{Context, Result};
use colored::Colorize;

use crate::cli::JobsCommands;
use crate::commands::{render, GlobalOptions};
use crate::domain::{ApplicationJobStatus, BackgroundJob};
use crate::ui;

/// One line per job: id, type, service, instance, status, detail
pub fn print_job_table(jobs: &[BackgroundJob]) {
    if jobs.is_empty() {
        ui::print_info("No jobs");
        return;
    }

    println!(
        "{:<38} {:<9} {:<24} {:<24} {:<10} {}",
        "ID".bold(),
        "TYPE".bold(),
        "SERVICE".bold(),
        "INSTANCE".bold(),
        "STATUS".bold(),
        "DETAIL".bold()
    );
    for job in jobs {
        let detail = job
            .error_message
            .as_deref()
            .or(job.image.as_deref())
            .unwrap_or("");
        println!(
            "{:<38} {:<9} {:<24} {:<24} {:<10} {}",
            job.id,
            job.job_type.to_string(),
            format!("{} {}", job.service_short_name, job.service_version),
            job.instance_id,
            ui::job_status(job.status),
            detail
        );
    }
}

pub fn print_application_jobs(status: &ApplicationJobStatus) {
    match status.status {
        Some(aggregate) => println!("Jobs: {}", ui::job_status(aggregate)),
        None => println!("Jobs: {}", "none".dimmed()),
    }
    print_job_table(&status.jobs);
}

fn print_job(job: &BackgroundJob) {
    println!("{:<14} {}", "ID:".bold(), job.id);
    println!("{:<14} {}", "Type:".bold(), job.job_type);
    println!("{:<14} {}", "Status:".bold(), ui::job_status(job.status));
    println!(
        "{:<14} {} {}",
        "Service:".bold(),
        job.service_short_name,
        job.service_version
    );
    println!("{:<14} {}", "Instance:".bold(), job.instance_id);
    println!(
        "{:<14} {} {}",
        "Application:".bold(),
        job.application_short_name,
        job.application_version
    );
    if let Some(image) = &job.image {
        println!("{:<14} {}", "Image:".bold(), image);
    }
    if let Some(message) = &job.error_message {
        println!("{:<14} {}", "Error:".bold(), message.red());
    }
    println!("{:<14} {}", "Created:".bold(), job.created_at.to_rfc3339());
    println!("{:<14} {}", "Updated:".bold(), job.updated_at.to_rfc3339());
}

pub async fn execute(options: &GlobalOptions, command: JobsCommands) -> Result<()> {
    let config = options.load_config()?;
    let tracker = options.job_tracker(&config).await?;

    match command {
        JobsCommands::List {
            application,
            version,
            service,
            service_version,
            output,
        } => {
            let jobs = match (application, version, service, service_version) {
                (Some(application), Some(version), _, _) => {
                    let status = tracker
                        .get_job_status_for_application(&application, &version)
                        .await
                        .context("Failed to read jobs")?;
                    return render(output, &status, print_application_jobs);
                }
                (_, _, Some(service), Some(version)) => tracker
                    .get_jobs_for_service(&service, &version)
                    .await
                    .context("Failed to read jobs")?,
                _ => tracker.get_all_jobs().await.context("Failed to read jobs")?,
            };
            render(output, &jobs, |jobs| print_job_table(jobs))
        }
        JobsCommands::Show { id, output } => {
            let job = tracker.get_job_by_id(&id).await?;
            render(output, &job, print_job)
        }
        JobsCommands::Cancel { id } => {
            if tracker.cancel(&id).await? {
                ui::print_success(&format!("Cancelled job {}", id));
            } else {
                ui::print_info(&format!("Job {} had already finished", id));
            }
            Ok(())
        }
        JobsCommands::Delete { id, all } => {
            if all {
                let count = tracker.delete_all_jobs().await?;
                ui::print_success(&format!("Deleted {} jobs", count));
            } else if let Some(id) = id {
                tracker.delete_job(&id).await?;
                ui::print_success(&format!("Deleted job {}", id));
            }
            Ok(())
        }
        JobsCommands::Purge => {
            let count = tracker.purge_expired().await?;
            ui::print_success(&format!(
                "Purged {} jobs older than {}",
                count,
                humantime::format_duration(config.jobs.retention())
            ));
            Ok(())
        }
    }
}

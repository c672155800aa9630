use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::cli::OutputFormat;
use crate::commands::jobs::print_application_jobs;
use crate::commands::{render, ControlPlane, GlobalOptions};
use crate::domain::{ApplicationJobStatus, JobStatus};
use crate::services::JobTracker;
use crate::ui;

/// Parse a human duration such as "90s" or "10m"
fn parse_duration(value: &str, what: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .with_context(|| format!("Invalid {} '{}' (expected e.g. 30s, 10m, 1h)", what, value))
}

/// Poll the given jobs of an application until none is in flight
///
/// Status changes are logged as they are observed. On timeout the remaining
/// jobs are cancelled.
async fn wait_for_jobs(
    jobs: &JobTracker,
    ids: &HashSet<String>,
    application: &str,
    version: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<ApplicationJobStatus> {
    let start = Instant::now();
    let mut seen: HashMap<String, JobStatus> = HashMap::new();

    loop {
        let watched = jobs
            .get_jobs_for_application(application, version)
            .await
            .context("Failed to read job status")?
            .into_iter()
            .filter(|j| ids.contains(&j.id))
            .collect();
        let status = ApplicationJobStatus::from_jobs(watched);

        for job in &status.jobs {
            if seen.insert(job.id.clone(), job.status) != Some(job.status) {
                info!(
                    job_id = %job.id,
                    "{} {} {}: {}",
                    job.job_type, job.service_short_name, job.service_version, job.status
                );
            }
        }

        if !status.jobs.iter().any(|j| j.status.is_in_flight()) {
            return Ok(status);
        }

        if start.elapsed() > timeout {
            for job in status.jobs.iter().filter(|j| j.status.is_in_flight()) {
                warn!(job_id = %job.id, "Cancelling job after timeout");
                jobs.cancel(&job.id).await?;
            }
            anyhow::bail!(
                "Deployment of {} {} did not finish within {}",
                application,
                version,
                humantime::format_duration(timeout)
            );
        }

        tokio::time::sleep(interval).await;
    }
}

pub async fn execute(
    options: &GlobalOptions,
    application: String,
    version: String,
    rebuild: bool,
    timeout: String,
    interval: String,
    output: OutputFormat,
) -> Result<()> {
    let timeout = parse_duration(&timeout, "timeout")?;
    let interval = parse_duration(&interval, "interval")?;

    if output == OutputFormat::Text {
        ui::print_header(&format!("Deploying {} {}", application, version));
    }

    let plane = ControlPlane::connect(options).await?;
    let started = plane
        .orchestrator
        .deploy_application(&application, &version, rebuild)
        .await
        .with_context(|| format!("Failed to deploy {} {}", application, version))?;
    info!(
        "Dispatched {} jobs for {} {}",
        started.jobs.len(),
        application,
        version
    );

    // Jobs started now, plus any that were still in flight from another run
    let ids: HashSet<String> = started
        .jobs
        .iter()
        .filter(|j| j.status.is_in_flight())
        .map(|j| j.id.clone())
        .collect();

    let status = wait_for_jobs(
        plane.orchestrator.jobs(),
        &ids,
        &application,
        &version,
        timeout,
        interval,
    )
    .await?;

    render(output, &status, print_application_jobs)?;

    match status.status {
        Some(JobStatus::Error) => anyhow::bail!(
            "Deployment of {} {} failed, see the job errors above",
            application,
            version
        ),
        Some(JobStatus::Cancelled) => {
            ui::print_warning("Some jobs were cancelled");
            Ok(())
        }
        _ => {
            if output == OutputFormat::Text {
                ui::print_success(&format!("Deployed {} {}", application, version));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BackgroundJob, JobType, ServiceRef};
    use crate::infrastructure::store::InMemoryJobStore;
    use std::sync::Arc;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90s", "timeout").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration(" 10m ", "timeout").unwrap(), Duration::from_secs(600));
        assert!(parse_duration("soon", "timeout").is_err());
    }

    fn tracker() -> JobTracker {
        JobTracker::new(Arc::new(InMemoryJobStore::new()), Duration::from_secs(3600))
    }

    fn job() -> BackgroundJob {
        BackgroundJob::new(
            JobType::Deploy,
            &ServiceRef::new("cart", "1.0.0"),
            "cart-1",
            "shop",
            "1.0.0",
        )
    }

    #[tokio::test]
    async fn test_wait_returns_once_jobs_finish() {
        let tracker = Arc::new(tracker());
        let (job, _) = tracker.register(job()).await.unwrap();

        let finisher = {
            let tracker = Arc::clone(&tracker);
            let id = job.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                tracker.mark_running(&id).await.unwrap();
                tracker.mark_done(&id, None).await.unwrap();
            })
        };

        let ids = HashSet::from([job.id.clone()]);
        let status = wait_for_jobs(
            &tracker,
            &ids,
            "shop",
            "1.0.0",
            Duration::from_secs(5),
            Duration::from_millis(5),
        )
        .await
        .unwrap();
        finisher.await.unwrap();
        assert_eq!(status.status, Some(JobStatus::Done));
    }

    #[tokio::test]
    async fn test_wait_cancels_on_timeout() {
        let tracker = tracker();
        let (job, token) = tracker.register(job()).await.unwrap();

        let ids = HashSet::from([job.id.clone()]);
        let result = wait_for_jobs(
            &tracker,
            &ids,
            "shop",
            "1.0.0",
            Duration::from_millis(20),
            Duration::from_millis(5),
        )
        .await;

        assert!(result.is_err());
        assert!(token.is_cancelled());
        assert_eq!(
            tracker.get_job_by_id(&job.id).await.unwrap().status,
            JobStatus::Cancelled
        );
    }
}

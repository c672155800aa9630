use anyhow::{Context, Result};

use crate::commands::jobs::print_application_jobs;
use crate::commands::{ControlPlane, GlobalOptions};
use crate::domain::JobStatus;
use crate::ui;

pub async fn execute(options: &GlobalOptions, application: String, version: String) -> Result<()> {
    ui::print_header(&format!("Undeploying {} {}", application, version));

    let plane = ControlPlane::connect(options).await?;
    let status = plane
        .orchestrator
        .undeploy_application(&application, &version)
        .await
        .with_context(|| format!("Failed to undeploy {} {}", application, version))?;

    print_application_jobs(&status);
    if status.status == Some(JobStatus::Error) {
        anyhow::bail!("Some instances of {} {} could not be removed", application, version);
    }

    ui::print_success(&format!("{} {} is undeployed", application, version));
    Ok(())
}

//! Status commands: application status and single-service status
//!
//! Both read live state through the status aggregator, which never fails on
//! partial cluster or metrics outages; those show up as messages instead.

use anyhow::{Context, Result};
use colored::Colorize;

use crate::cli::OutputFormat;
use crate::commands::{render, ControlPlane, GlobalOptions};
use crate::domain::{ApplicationStatus, ServiceStatus};
use crate::infrastructure::StateStore;
use crate::ui;

fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

fn format_metric(value: Option<f64>, format: impl Fn(f64) -> String) -> String {
    value.map(format).unwrap_or_else(|| "-".to_string())
}

fn print_service_status(status: &ServiceStatus) {
    let replicas = format!(
        "{}/{}",
        status.available_replicas, status.requested_replicas
    );
    let replicas = if status.available_replicas == status.requested_replicas
        && status.requested_replicas > 0
    {
        replicas.green()
    } else {
        replicas.yellow()
    };
    println!(
        "{} {} ({}) replicas {}",
        status.short_name.bold(),
        status.version,
        status.name,
        replicas
    );

    for interface in &status.interfaces {
        let ips = if interface.external_ips.is_empty() {
            "<pending>".to_string()
        } else {
            interface.external_ips.join(", ")
        };
        let ports: Vec<String> = interface.ports.iter().map(|p| p.to_string()).collect();
        println!("  interface {:<12} {} ports {}", interface.name, ips, ports.join(","));
    }

    if !status.pods.is_empty() {
        println!(
            "  {:<36} {:<10} {:<16} {:<9} {:<14} {:<10} {}",
            "POD", "PHASE", "NODE", "RESTARTS", "AGE", "CPU", "MEMORY"
        );
    }
    for pod in &status.pods {
        println!(
            "  {:<36} {:<10} {:<16} {:<9} {:<14} {:<10} {}",
            pod.name,
            pod.phase,
            pod.node_name.as_deref().unwrap_or("-"),
            pod.restarts,
            pod.age.as_deref().unwrap_or("-"),
            format_metric(pod.metrics.cpu_load, |v| format!("{:.2}", v)),
            format_metric(pod.metrics.memory_usage, format_bytes),
        );
    }

    for node in &status.nodes {
        println!(
            "  node {:<16} pods {:<3} avg cpu {:<8} avg memory {}",
            node.node_name,
            node.pod_count,
            format_metric(node.average_cpu_load, |v| format!("{:.2}", v)),
            format_metric(node.average_memory_usage, format_bytes),
        );
    }

    for message in &status.error_messages {
        ui::print_error(message);
    }
}

fn print_application_status(status: &ApplicationStatus) {
    println!(
        "Deployment: {}",
        ui::deployment_status(status.deployment_status.value)
    );
    for message in &status.deployment_status.messages {
        ui::print_message(message.message_type, &message.content);
    }
    println!(
        "Services: {}  Pods: {}  Replicas: {}/{}",
        status.total_services,
        status.total_pods,
        status.total_available_replicas,
        status.total_requested_replicas
    );
    println!();
    for service in &status.service_statuses {
        print_service_status(service);
        println!();
    }
}

pub async fn execute_application(
    options: &GlobalOptions,
    application: String,
    version: String,
    output: OutputFormat,
) -> Result<()> {
    let plane = ControlPlane::connect(options).await?;
    let app = plane
        .store
        .get_application(&application, &version)
        .await
        .with_context(|| format!("Failed to load application {} {}", application, version))?;

    if output == OutputFormat::Text {
        ui::print_header(&format!("Status of {}", app));
    }
    let status = plane.status.get_application_status(&app).await;
    render(output, &status, print_application_status)
}

pub async fn execute_service(
    options: &GlobalOptions,
    service: String,
    version: String,
    output: OutputFormat,
) -> Result<()> {
    let plane = ControlPlane::connect(options).await?;
    let service = plane
        .store
        .get_service(&service, &version)
        .await
        .with_context(|| format!("Failed to load service {} {}", service, version))?;

    let status = plane.status.get_service_status(&service).await;
    render(output, &status, print_service_status)
}

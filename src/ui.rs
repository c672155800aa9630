// Terminal output helpers shared by the commands

use colored::{ColoredString, Colorize};

use crate::domain::{DeploymentStatusValue, JobStatus, MessageType};

pub fn print_header(title: &str) {
    println!();
    println!(
        "{}",
        "╔════════════════════════════════════════════════════════════╗".bright_blue()
    );
    println!("{}", format!("║  {:<58}║", title).bright_blue());
    println!(
        "{}",
        "╚════════════════════════════════════════════════════════════╝".bright_blue()
    );
    println!();
}

pub fn print_success(message: &str) {
    println!("{}", format!("✅ {}", message).bright_green().bold());
}

pub fn print_error(message: &str) {
    eprintln!("{}", format!("❌ {}", message).bright_red().bold());
}

pub fn print_info(message: &str) {
    println!("{}", format!("ℹ️  {}", message).bright_cyan());
}

pub fn print_warning(message: &str) {
    println!("{}", format!("⚠️  {}", message).bright_yellow());
}

pub fn job_status(status: JobStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        JobStatus::Done => label.green(),
        JobStatus::Error => label.red().bold(),
        JobStatus::Running => label.cyan(),
        JobStatus::Pending => label.yellow(),
        JobStatus::Cancelled => label.dimmed(),
    }
}

pub fn deployment_status(status: DeploymentStatusValue) -> ColoredString {
    let label = status.to_string();
    match status {
        DeploymentStatusValue::Deployed => label.green().bold(),
        DeploymentStatusValue::Pending => label.yellow(),
        DeploymentStatusValue::Incomplete => label.red(),
        DeploymentStatusValue::Unknown => label.magenta(),
        DeploymentStatusValue::Undeployed => label.dimmed(),
    }
}

/// Print a status message with the marker of its severity
pub fn print_message(message_type: MessageType, content: &str) {
    match message_type {
        MessageType::Info => print_info(content),
        MessageType::Warning => print_warning(content),
        MessageType::Error => print_error(content),
    }
}

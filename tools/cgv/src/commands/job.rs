//! Inspect finished jobs through their status files.
//!
//! Usage:
//!   cgv job <job-id>          # One job
//!   cgv job <job-id> --json   # Raw status record
//!   cgv jobs --last 50        # Recent jobs

use anyhow::{anyhow, bail, Result};
use cgmesgate_core::job::STATUS_FILE;
use cgmesgate_core::{JobId, ValidationJob};
use colored::Colorize;
use std::path::Path;

use crate::commands::validate::display_job;
use crate::utils::{format_state, list_jobs, load_config};

pub fn run_show(config: Option<&Path>, job_id: &str, json_output: bool) -> Result<()> {
    // Parsed as a uuid, so it cannot name anything outside results/.
    let id: JobId = job_id.parse().map_err(|e: String| anyhow!(e))?;
    let config = load_config(config)?;

    let path = config.results_dir().join(id.to_string()).join(STATUS_FILE);
    if !path.exists() {
        bail!("No status file for job {}", id);
    }
    let job = ValidationJob::read_status(&path)?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        display_job(&job);
    }
    Ok(())
}

pub fn run_list(config: Option<&Path>, last: usize) -> Result<()> {
    let config = load_config(config)?;
    let jobs = list_jobs(&config.results_dir())?;

    if jobs.is_empty() {
        println!("{}", "No jobs recorded".yellow());
        return Ok(());
    }

    println!(
        "{:<38} {:<10} {:<12} {}",
        "JOB".bright_white(),
        "GATE".bright_white(),
        "STATE".bright_white(),
        "SUBMITTED".bright_white()
    );
    for job in jobs.iter().take(last) {
        println!(
            "{:<38} {:<10} {:<12} {}",
            job.id.to_string(),
            job.gate.to_string(),
            format_state(job.state),
            job.submitted_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if jobs.len() > last {
        println!("{}", format!("... {} older job(s)", jobs.len() - last).dimmed());
    }
    Ok(())
}

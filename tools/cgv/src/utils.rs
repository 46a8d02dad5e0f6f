use anyhow::{Context, Result};
use cgmesgate_core::job::STATUS_FILE;
use cgmesgate_core::{JobState, ReadinessState, ServiceConfig, ValidationJob, ValidationService};
use colored::Colorize;
use std::fs;
use std::path::Path;

/// Load configuration (file + environment)
pub fn load_config(explicit: Option<&Path>) -> Result<ServiceConfig> {
    ServiceConfig::load(explicit).context(
        "Failed to load configuration.\n\
         Run 'cgv init' or pass --config <file>.",
    )
}

/// Load configuration and open the service on its data directory
pub fn open_service(explicit: Option<&Path>) -> Result<ValidationService> {
    let config = load_config(explicit)?;
    let data_dir = config.data_dir.clone();
    ValidationService::open(config)
        .with_context(|| format!("Failed to open data directory: {}", data_dir.display()))
}

/// All readable job status files under `results_dir`, newest first.
///
/// Unreadable or foreign entries are skipped.
pub fn list_jobs(results_dir: &Path) -> Result<Vec<ValidationJob>> {
    let mut jobs = Vec::new();

    if !results_dir.exists() {
        return Ok(jobs);
    }

    for entry in fs::read_dir(results_dir)? {
        let path = entry?.path().join(STATUS_FILE);
        if let Ok(job) = ValidationJob::read_status(&path) {
            jobs.push(job);
        }
    }

    jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
    Ok(jobs)
}

pub fn format_state(state: JobState) -> String {
    match state {
        JobState::Queued => "QUEUED".yellow().to_string(),
        JobState::Running => "RUNNING".blue().to_string(),
        JobState::Succeeded => "SUCCEEDED".green().to_string(),
        JobState::Failed => "FAILED".red().to_string(),
        JobState::TimedOut => "TIMED OUT".red().to_string(),
    }
}

pub fn format_readiness(state: ReadinessState) -> String {
    match state {
        ReadinessState::Ready => "READY".green().to_string(),
        ReadinessState::Installing => "INSTALLING".yellow().to_string(),
        ReadinessState::NotReady => "NOT READY".yellow().to_string(),
        ReadinessState::Degraded => "DEGRADED".red().to_string(),
    }
}

/// Seconds between start and finish, when both are known
pub fn job_duration(job: &ValidationJob) -> Option<f64> {
    let (start, end) = (job.started_at?, job.finished_at?);
    Some((end - start).num_milliseconds() as f64 / 1000.0)
}

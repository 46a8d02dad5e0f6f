//! Run a validation in-process and wait for it.
//!
//! Usage:
//!   cgv validate -g bds 20210101T0000Z__ENTSOE_BD_001.xml
//!   cgv validate -g full_cgm BD.xml models.zip --timeout 600
//!
//! Exits non-zero unless the job succeeds.

use anyhow::{anyhow, bail, Context, Result};
use cgmesgate_core::{JobId, JobState, ModelUpload, ValidationGate, ValidationJob, ValidationService};
use colored::Colorize;
use log::debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::{format_readiness, format_state, job_duration, load_config};

const POLL: Duration = Duration::from_secs(5);

pub fn run(
    config: Option<&Path>,
    gate: &str,
    files: &[PathBuf],
    timeout: Option<u64>,
    json_output: bool,
) -> Result<()> {
    let gate: ValidationGate = gate.parse().map_err(|e: String| anyhow!(e))?;

    let mut config = load_config(config)?;
    if let Some(secs) = timeout {
        config.execution.timeout_secs = secs;
        config.validate()?;
    }

    let uploads = files
        .iter()
        .map(|path| {
            ModelUpload::from_path(path).with_context(|| format!("Failed to read {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let service = ValidationService::open(config)?;

    if !json_output {
        println!("{}", format!("Validating against gate '{}'...", gate.label()).bright_blue());
        println!();
        println!(
            "  {} RSL {} ({})",
            "→".bright_blue(),
            service.rsl_version().unwrap_or_else(|| "none".to_string()),
            format_readiness(service.readiness())
        );
    }

    let id = service.submit(gate, uploads).context("Submission rejected")?;

    if !json_output {
        println!("  {} Job {}", "✓".green(), id.to_string().bright_white());
        println!("  {} Waiting for the engine...", "→".bright_blue());
    }

    let job = wait_for(&service, id, json_output)?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        println!();
        display_job(&job);
    }

    if job.state != JobState::Succeeded {
        bail!("Validation {} ({})", job.state, id);
    }
    Ok(())
}

fn wait_for(service: &ValidationService, id: JobId, quiet: bool) -> Result<ValidationJob> {
    loop {
        let job = service
            .wait(id, POLL)
            .ok_or_else(|| anyhow!("Job {} disappeared", id))?;

        if job.state.is_terminal() {
            return Ok(job);
        }

        debug!("job={} state={} Still waiting", id, job.state);
        if !quiet {
            let health = service.health();
            println!(
                "    {} {} ({} running, {} queued)",
                "…".dimmed(),
                format_state(job.state),
                health.running_jobs,
                health.queued_jobs
            );
        }
    }
}

pub fn display_job(job: &ValidationJob) {
    println!("{}", "─".repeat(60).bright_blue());
    println!(
        "  {} {} {}",
        "Job:".bright_white().bold(),
        job.id.to_string().bright_white().bold(),
        format!("[{}]", job.gate).dimmed()
    );
    println!("  {} {}", "State:".bright_white(), format_state(job.state));
    println!(
        "  {} {}",
        "RSL:".bright_white(),
        job.rsl_version.as_deref().unwrap_or("unknown")
    );
    println!("  {} {}", "Inputs:".bright_white(), job.inputs.join(", ").dimmed());

    if let Some(code) = job.exit_code {
        println!("  {} {}", "Exit code:".bright_white(), code);
    }
    if let Some(secs) = job_duration(job) {
        println!("  {} {:.1}s", "Duration:".bright_white(), secs);
    }
    if let Some(report) = &job.report {
        println!("  {} {}", "Report:".bright_white(), report.display().to_string().green());
    }
    if let Some(archive) = &job.results_archive {
        println!("  {} {}", "Results:".bright_white(), archive.display());
    }
    if let Some(failure) = &job.failure {
        println!("  {} {} {}", "✗".red(), failure.kind.red(), failure.message);
    }
    if !job.stderr.trim().is_empty() {
        println!();
        println!("  {}", "stderr:".bright_white());
        for line in job.stderr.lines().rev().take(20).collect::<Vec<_>>().into_iter().rev() {
            println!("    {}", line.dimmed());
        }
    }
    println!("{}", "─".repeat(60).bright_blue());
}

//! Show service readiness.
//!
//! Usage:
//!   cgv status          # Human-readable
//!   cgv status --json   # Health snapshot as JSON

use anyhow::Result;
use colored::Colorize;
use std::path::Path;

use crate::utils::{format_readiness, list_jobs, open_service};

pub fn run(config: Option<&Path>, json_output: bool) -> Result<()> {
    let service = open_service(config)?;
    let health = service.health();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&health)?);
        return Ok(());
    }

    let jobs = list_jobs(&service.config().results_dir())?;
    let unfinished = jobs.iter().filter(|j| !j.state.is_terminal()).count();

    println!("{}", "─".repeat(60).bright_blue());
    println!("  {} {}", "State:".bright_white(), format_readiness(health.state));
    println!(
        "  {} {}",
        "RSL version:".bright_white(),
        health.rsl_version.as_deref().unwrap_or("none")
    );
    println!("  {} {}", "Data dir:".bright_white(), service.config().data_dir.display());
    println!("  {} {}", "Launcher:".bright_white(), service.config().launcher().display());
    println!(
        "  {} {} running, {} queued, max {}",
        "Capacity:".bright_white(),
        health.running_jobs,
        health.queued_jobs,
        health.max_running
    );
    println!("  {} {} recorded", "Jobs:".bright_white(), jobs.len());
    if unfinished > 0 {
        println!(
            "  {} {} job(s) never reached a final state",
            "⚠".yellow(),
            unfinished
        );
    }
    println!("{}", "─".repeat(60).bright_blue());

    Ok(())
}

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod utils;

/// cgmesgate operator tool: install rule sets and run CGMES validations
///
/// cgv works directly on the data directory. Commands that open the service
/// (install, status, validate) refuse to run while another process owns it.
#[derive(Parser)]
#[command(name = "cgv")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: ./cgmesgate.yaml, ~/.cgmesgate.yaml, /etc/cgmesgate/config.yaml)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a sample configuration file
    Init {
        /// Path of the configuration file to create
        #[arg(default_value = "cgmesgate.yaml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Install a Rule Set Library bundle (.zip)
    Install {
        /// RSL bundle archive
        bundle: PathBuf,
    },

    /// Show readiness, RSL version and capacity
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate model files against a gate and wait for the result
    Validate {
        /// Gate: full, full_igm, full_cgm or bds
        #[arg(long, short)]
        gate: String,

        /// Model/boundary files or zips of them
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Override the engine timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Output the final job record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a job from its status file
    Job {
        /// Job ID
        job_id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List jobs with a status file, newest first
    Jobs {
        /// Number of jobs to show
        #[arg(long, default_value = "20")]
        last: usize,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => {
            commands::init::run(&path, force)?;
        }
        Commands::Install { bundle } => {
            commands::install::run(config, &bundle)?;
        }
        Commands::Status { json } => {
            commands::status::run(config, json)?;
        }
        Commands::Validate { gate, files, timeout, json } => {
            commands::validate::run(config, &gate, &files, timeout, json)?;
        }
        Commands::Job { job_id, json } => {
            commands::job::run_show(config, &job_id, json)?;
        }
        Commands::Jobs { last } => {
            commands::job::run_list(config, last)?;
        }
    }

    Ok(())
}

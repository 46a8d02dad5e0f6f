//! Install a Rule Set Library bundle.
//!
//! Usage:
//!   cgv install RSL_v2.5.zip

use anyhow::{Context, Result};
use cgmesgate_core::archive::inspect_zip;
use cgmesgate_core::UploadedArchive;
use colored::Colorize;
use std::path::Path;

use crate::utils::{format_readiness, open_service};

pub fn run(config: Option<&Path>, bundle: &Path) -> Result<()> {
    println!("{}", "Installing RSL bundle...".bright_blue());
    println!();

    println!("  {} Opening data directory...", "→".bright_blue());
    let service = open_service(config)?;
    println!(
        "    {} {} ({})",
        "✓".green(),
        service.config().data_dir.display(),
        format_readiness(service.readiness())
    );
    println!();

    println!("  {} Reading {}...", "→".bright_blue(), bundle.display());
    let upload = UploadedArchive::from_path(bundle)
        .with_context(|| format!("Failed to read bundle: {}", bundle.display()))?;
    match inspect_zip(&upload.bytes) {
        Ok(entries) => println!(
            "    {} {} bytes, {} entries",
            "✓".green(),
            upload.bytes.len(),
            entries.len()
        ),
        Err(_) => println!("    {} {} bytes", "✓".green(), upload.bytes.len()),
    }
    println!();

    println!("  {} Validating and activating...", "→".bright_blue());
    let installed = service.install_rsl(&upload);
    let state = format_readiness(service.readiness());

    let bundle = match installed {
        Ok(bundle) => bundle,
        Err(e) => {
            println!("    {} {}", "✗".red(), e.to_string().red());
            println!();
            println!("  State: {}", state);
            return Err(e).context("RSL installation failed");
        }
    };

    println!("    {} Installed", "✓".green());
    println!();
    println!("{}", "RSL bundle:".bright_white());
    println!("  Version:   {}", bundle.version().unwrap_or("unknown").bright_white());
    println!("  Engine:    {}", bundle.engine_jar().display());
    println!("  sha256:    {}", bundle.engine_sha256().dimmed());
    println!("  Converter: {}", bundle.converter_jar().display());
    println!("  sha256:    {}", bundle.converter_sha256().dimmed());
    println!("  State:     {}", state);

    Ok(())
}

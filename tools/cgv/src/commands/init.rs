use anyhow::{bail, Result};
use cgmesgate_core::ServiceConfig;
use colored::Colorize;
use std::path::Path;

pub fn run(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("Config file already exists: {} (use --force to overwrite)", path.display());
    }

    println!("{}", "Writing sample configuration...".bright_blue());
    ServiceConfig::create_sample(path)?;

    println!("{} {}", "✓ Created".green(), path.display());
    println!();
    println!("Next steps:");
    println!("  vim {}            {}", path.display(), "# Set data_dir and java.path".dimmed());
    println!("  cgv install RSL.zip        {}", "# Install the Rule Set Library".dimmed());
    println!("  cgv validate -g bds BD.xml {}", "# Run a first validation".dimmed());

    Ok(())
}

//! Write a starter `boxrun.toml` into the current project.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::config::CONFIG_FILE;
use crate::templates;

/// What happened to the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Created,
    Overwritten,
    Skipped,
}

pub(crate) fn run(force: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    info!("Initializing boxrun in {}", cwd.display());

    let outcome = write_config(&cwd, force)?;
    print!("{}", summary(outcome));
    Ok(())
}

/// Writes the template into `dir`, keeping an existing file unless `force`.
fn write_config(dir: &Path, force: bool) -> Result<Outcome> {
    let path = dir.join(CONFIG_FILE);
    let existed = path.exists();
    if existed && !force {
        return Ok(Outcome::Skipped);
    }

    fs::write(&path, templates::BOXRUN_TOML)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(if existed {
        Outcome::Overwritten
    } else {
        Outcome::Created
    })
}

fn summary(outcome: Outcome) -> String {
    let line = match outcome {
        Outcome::Created => format!("  {} - sandbox configuration", CONFIG_FILE.cyan()),
        Outcome::Overwritten => format!("  {} {CONFIG_FILE} (overwritten)", "↻".blue()),
        Outcome::Skipped => format!(
            "  {} {CONFIG_FILE} (already exists, use --force to overwrite)",
            "⊘".yellow()
        ),
    };

    format!(
        "\n{} boxrun initialized\n\n{line}\n\n{}\n  1. Edit {} to pick the image and backend\n  2. Run {} to run your tests in the sandbox\n",
        "✓".green().bold(),
        "Next steps:".yellow().bold(),
        CONFIG_FILE.cyan(),
        "boxrun run -- test".green()
    )
}

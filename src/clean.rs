use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use crate::args::BaseArgs;
use crate::ui::{print_command_status, CommandStatus};
use crate::utils::pluralize;
use crate::workflow::WorkflowSettings;

const TMP_DIR: &str = "tmp";

#[derive(Debug, Clone, Args)]
pub struct CleanArgs {}

pub async fn run(base: BaseArgs, _args: CleanArgs) -> Result<()> {
    let settings = WorkflowSettings::load(&base.workflow_dir)?;
    let removed = clean_workflow(&base.workflow_dir, &settings)?;

    if base.json {
        let paths: Vec<String> = removed.iter().map(|p| p.display().to_string()).collect();
        println!("{}", serde_json::to_string(&paths)?);
    } else {
        print_command_status(
            CommandStatus::Success,
            &format!("Removed {}", pluralize(removed.len(), "directory", Some("directories"))),
        );
    }
    Ok(())
}

/// Remove the MCMC data, analysis output and tmp directories. Returns the
/// directories that existed.
pub fn clean_workflow(workflow_dir: &Path, settings: &WorkflowSettings) -> Result<Vec<PathBuf>> {
    let mut targets = vec![(
        "MCMC data",
        workflow_dir.join(&settings.sampling.mcmc_data.directory),
    )];
    if let Some(output_dir) = &settings.analysis.output_dir {
        targets.push(("analysis output", workflow_dir.join(output_dir)));
    }
    targets.push(("tmp", workflow_dir.join(TMP_DIR)));

    let mut removed = Vec::new();
    for (label, dir) in targets {
        if !dir.is_dir() {
            continue;
        }
        fs::remove_dir_all(&dir).with_context(|| format!("failed to remove {}", dir.display()))?;
        info!("Cleaned {label} directory: {}", dir.display());
        removed.push(dir);
    }
    Ok(removed)
}

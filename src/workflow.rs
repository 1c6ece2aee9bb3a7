use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

pub const SETTINGS_FILE: &str = "workflow.yaml";
const DEFAULT_MCMC_DATA_DIR: &str = "mcmcdata";

/// `workflow.yaml` at the root of a workflow bundle.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSettings {
    pub sampling: SamplingSettings,
    #[serde(default)]
    pub serverless: ServerlessSettings,
    #[serde(default)]
    pub analysis: AnalysisSettings,
    /// Remaining sections; `sampling.sync` names the one holding the server
    /// settings.
    #[serde(flatten)]
    pub sections: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplingSettings {
    #[serde(default = "default_sync")]
    pub sync: SyncSetting,
    #[serde(default)]
    pub mcmc_data: McmcDataSettings,
    #[serde(default)]
    pub julia_args: Vec<String>,
    /// Explicit sampler command; the Julia invocation is built when absent.
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SyncSetting {
    Flag(bool),
    Section(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct McmcDataSettings {
    #[serde(default = "default_mcmc_data_dir")]
    pub directory: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerlessSettings {
    #[serde(default)]
    pub engine: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalysisSettings {
    #[serde(default)]
    pub output_dir: Option<String>,
}

/// Server section selected by `sampling.sync`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerSettings {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub workflow_id: String,
    #[serde(default)]
    pub experiment_name: String,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
}

fn default_sync() -> SyncSetting {
    SyncSetting::Section("coinfer".to_string())
}

fn default_mcmc_data_dir() -> String {
    DEFAULT_MCMC_DATA_DIR.to_string()
}

impl Default for McmcDataSettings {
    fn default() -> Self {
        Self {
            directory: default_mcmc_data_dir(),
        }
    }
}

impl SyncSetting {
    pub fn is_enabled(&self) -> bool {
        match self {
            SyncSetting::Flag(enabled) => *enabled,
            SyncSetting::Section(name) => name != "off",
        }
    }
}

impl WorkflowSettings {
    pub fn load(workflow_dir: &Path) -> Result<Self> {
        let path = workflow_dir.join(SETTINGS_FILE);
        let text =
            fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn is_sync(&self) -> bool {
        self.sampling.sync.is_enabled()
    }

    /// Server settings for a syncing run; empty when syncing is off or the
    /// named section is missing.
    pub fn server(&self) -> Result<ServerSettings> {
        let SyncSetting::Section(name) = &self.sampling.sync else {
            return Ok(ServerSettings::default());
        };
        match self.sections.get(name) {
            Some(section) => serde_json::from_value(section.clone())
                .with_context(|| format!("invalid `{name}` section in {SETTINGS_FILE}")),
            None => Ok(ServerSettings::default()),
        }
    }

    /// `<workflow>/<directory>`, scoped by experiment id when syncing.
    pub fn mcmc_data_path(&self, workflow_dir: &Path, experiment_id: Option<&str>) -> PathBuf {
        let base = workflow_dir.join(&self.sampling.mcmc_data.directory);
        match experiment_id.filter(|id| !id.is_empty()) {
            Some(id) => base.join(id),
            None => base,
        }
    }
}

impl ServerSettings {
    pub fn require_endpoint(&self) -> Result<&str> {
        if self.endpoint.trim().is_empty() {
            return Err(anyhow!("server endpoint is not configured"));
        }
        Ok(&self.endpoint)
    }
}

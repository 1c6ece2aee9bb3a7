use std::path::PathBuf;

use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct BaseArgs {
    /// Output as JSON
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Enable debug logging (or set COINFER_LOG_LEVEL)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Auth token for the Coinfer server (or via COINFER_AUTH_TOKEN)
    #[arg(long, env = "COINFER_AUTH_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,

    /// Override the server endpoint from workflow.yaml (or via COINFER_SERVER_ENDPOINT)
    #[arg(long, env = "COINFER_SERVER_ENDPOINT", hide_env_values = true, global = true)]
    pub endpoint: Option<String>,

    /// Workflow directory containing workflow.yaml
    #[arg(short = 'C', long, default_value = ".", global = true)]
    pub workflow_dir: PathBuf,

    /// Path to a .env file to load before running commands.
    #[arg(long, env = "COINFER_ENV_FILE", hide_env_values = true)]
    pub env_file: Option<PathBuf>,
}

impl BaseArgs {
    pub fn endpoint_override(&self) -> Option<&str> {
        self.endpoint
            .as_deref()
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
    }
}

#[derive(Debug, Clone, Args)]
pub struct CLIArgs<T: Args> {
    #[command(flatten)]
    pub base: BaseArgs,

    #[command(flatten)]
    pub args: T,
}

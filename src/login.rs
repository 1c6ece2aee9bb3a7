use anyhow::{anyhow, Result};
use clap::Args;
use serde_json::json;

use crate::args::BaseArgs;
use crate::client::{ApiClient, Unauthorized};
use crate::config;
use crate::ui::{print_command_status, CommandStatus};
use crate::workflow::WorkflowSettings;

pub const LOGIN_PROMPT: &str = "\
To run the sample command with results sent to the server, you need a token.

You can get a token at https://coinfer.ai/bayes/#/home > Profile.

Then run `coinfer login --token <token>` to set the token.";

#[derive(Debug, Clone, Args)]
pub struct LoginArgs {
    /// Only check the stored token; do not save --token
    #[arg(long)]
    pub no_save: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    LoggedIn { username: String },
    InvalidToken,
}

pub async fn run(base: BaseArgs, args: LoginArgs) -> Result<()> {
    let explicit = base.token.as_deref().map(str::trim).filter(|t| !t.is_empty());
    if let (Some(token), false) = (explicit, args.no_save) {
        let path = config::global_path().unwrap_or_else(|_| config::fallback_path());
        config::save_token(&path, token)?;
        print_command_status(
            CommandStatus::Success,
            &format!("Saved token to {}", path.display()),
        );
    }

    let Some(token) = config::resolve_token(explicit) else {
        println!("{LOGIN_PROMPT}");
        return Ok(());
    };

    let endpoint = resolve_endpoint(&base)?;
    let client = ApiClient::new(&endpoint, &token)?;
    match check_token(&client).await? {
        LoginState::LoggedIn { username } => {
            if base.json {
                println!("{}", json!({ "username": username, "endpoint": endpoint }));
            } else {
                print_command_status(
                    CommandStatus::Success,
                    &format!("You're logged in as {username}."),
                );
            }
        }
        LoginState::InvalidToken => {
            print_command_status(CommandStatus::Error, "Token invalid.");
            println!("{LOGIN_PROMPT}");
        }
    }
    Ok(())
}

/// `--endpoint` when given, otherwise the workflow's server section.
pub fn resolve_endpoint(base: &BaseArgs) -> Result<String> {
    if let Some(endpoint) = base.endpoint_override() {
        return Ok(endpoint.to_string());
    }
    let settings = WorkflowSettings::load(&base.workflow_dir)?;
    let server = settings.server()?;
    server
        .require_endpoint()
        .map(str::to_string)
        .map_err(|_| anyhow!("no server endpoint: pass --endpoint or configure it in workflow.yaml"))
}

/// Validate the client's token against the user endpoint.
pub async fn check_token(client: &ApiClient) -> Result<LoginState> {
    match client.get_user_info().await {
        Ok(user) => {
            let username = user
                .get("username")
                .and_then(|name| name.as_str())
                .ok_or_else(|| anyhow!("user info has no username"))?;
            Ok(LoginState::LoggedIn {
                username: username.to_string(),
            })
        }
        Err(err) if err.downcast_ref::<Unauthorized>().is_some() => Ok(LoginState::InvalidToken),
        Err(err) => Err(err),
    }
}

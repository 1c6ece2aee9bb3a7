use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::args::BaseArgs;
use crate::client::{ApiClient, RunInfo};
use crate::config;
use crate::login::LOGIN_PROMPT;
use crate::mcmc::{interval_from_env, RunIds, SyncConfig};
use crate::runner::{ModelCommand, ModelRunHandler, RunOutcome, RunStatus};
use crate::ui::{print_command_status, CommandStatus};
use crate::utils::{gen_batch_id, pluralize};
use crate::workflow::{ServerSettings, WorkflowSettings};

const DATA_SCRIPT: &str = "data.py";
const MODEL_DIR: &str = "model";
const MODEL_METADATA: &str = ".metadata";
const MODEL_SCRIPT: &str = "script.jl";
const CLIENT_ENTRYPOINT: &str = "client/Coinfer.jl";
const JULIA_BIN_DIR: &str = "/usr/local/julia/bin";

#[derive(Debug, Clone, Args)]
pub struct SampleArgs {
    /// Seconds between MCMC data sends (defaults to COINFER_DATA_SENDING_INTERVAL or 3)
    #[arg(long, value_name = "SECONDS")]
    pub interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ModelMetadata {
    entrance_file: String,
}

/// Server-side state of a syncing run.
struct Experiment {
    client: ApiClient,
    workflow_id: String,
    endpoint: String,
    token: String,
    run: RunIds,
}

impl Experiment {
    fn group(&self) -> String {
        format!("object_{}", self.run.experiment_id)
    }

    async fn send(&self, action: &str, data: Option<Value>) {
        let mut message = json!({ "action": action });
        if let (Some(data), Some(fields)) = (data, message.as_object_mut()) {
            fields.insert("data".to_string(), data);
        }
        if let Err(err) = self.client.sendmsg(&self.group(), message).await {
            warn!("failed to send {action}: {err:#}");
        }
    }

    async fn set_status(&self, status: &str) -> Result<()> {
        let mut data = Map::new();
        data.insert("status".to_string(), json!(status));
        self.client
            .update_experiment(&self.run.experiment_id, data)
            .await
            .with_context(|| format!("failed to mark experiment {status}"))?;
        Ok(())
    }

    async fn report_failure(&self, message: &str) {
        self.send("experiment:error", Some(json!(message))).await;
        if let Err(err) = self.set_status(RunStatus::Err.as_str()).await {
            error!("{err:#}");
        }
    }
}

pub async fn run(base: BaseArgs, args: SampleArgs) -> Result<()> {
    let workflow_dir = std::path::absolute(&base.workflow_dir)
        .with_context(|| format!("invalid workflow directory {}", base.workflow_dir.display()))?;
    let settings = WorkflowSettings::load(&workflow_dir)?;
    let interval = match args.interval {
        Some(secs) => Duration::from_secs(secs),
        None => interval_from_env()?,
    };

    let mut server = settings.server()?;
    if let Some(endpoint) = base.endpoint_override() {
        server.endpoint = endpoint.to_string();
    }

    let experiment = if settings.is_sync() {
        let Some(token) = config::resolve_token(base.token.as_deref()) else {
            println!("{LOGIN_PROMPT}");
            return Ok(());
        };
        Some(start_experiment(&settings, &server, token).await?)
    } else {
        None
    };

    let outcome = match sample(&workflow_dir, &settings, experiment.as_ref(), interval).await {
        Ok(outcome) => outcome,
        Err(err) => {
            if let Some(experiment) = &experiment {
                error!(experiment_id = %experiment.run.experiment_id, "failed to run experiment: {err:#}");
                experiment.report_failure(&format!("{err:#}")).await;
            }
            return Err(err);
        }
    };

    report(&base, &outcome, experiment.as_ref());
    if outcome.status != RunStatus::SampleFin {
        bail!(
            "sampling finished with status {}: {}",
            outcome.status.as_str(),
            outcome.error_message().unwrap_or_default()
        );
    }
    Ok(())
}

async fn start_experiment(
    settings: &WorkflowSettings,
    server: &ServerSettings,
    token: String,
) -> Result<Experiment> {
    let endpoint = server.require_endpoint()?.to_string();
    let mut client = ApiClient::new(&endpoint, &token)?;
    let (experiment, _) = client
        .ensure_experiment_for_workflow(
            &server.workflow_id,
            &server.experiment_name,
            &settings.serverless.engine,
        )
        .await
        .context("failed to get experiment for workflow")?;
    let experiment_id = experiment
        .get("short_id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("experiment has no short_id"))?
        .to_string();

    let mut run_info = cloud_run_info();
    let batch_id = server.batch_id.clone().unwrap_or_else(gen_batch_id);
    let run_id = server.run_id.clone().unwrap_or_else(gen_batch_id);
    run_info.experiment_id = experiment_id.clone();
    if run_info.run_on.is_some() {
        run_info.batch_id = std::env::var("COINFER_BATCH_ID").unwrap_or_else(|_| batch_id.clone());
        run_info.run_id = std::env::var("COINFER_RUN_ID").unwrap_or_else(|_| run_id.clone());
    } else {
        run_info.batch_id = batch_id.clone();
        run_info.run_id = run_id.clone();
    }
    client.set_run_info(run_info);

    let experiment = Experiment {
        client,
        workflow_id: server.workflow_id.clone(),
        endpoint,
        token,
        run: RunIds {
            experiment_id,
            batch_id,
            run_id,
        },
    };
    experiment.set_status("RUN").await?;
    experiment.send("start", None).await;
    info!(experiment_id = %experiment.run.experiment_id, batch_id = %experiment.run.batch_id, "experiment started");
    Ok(experiment)
}

async fn sample(
    workflow_dir: &Path,
    settings: &WorkflowSettings,
    experiment: Option<&Experiment>,
    interval: Duration,
) -> Result<RunOutcome> {
    if workflow_dir.join(DATA_SCRIPT).is_file() {
        run_data_script(workflow_dir, experiment).await?;
    }

    let experiment_id = experiment.map(|e| e.run.experiment_id.as_str());
    let data_dir = settings.mcmc_data_path(workflow_dir, experiment_id);
    let argv = model_argv(workflow_dir, settings)?;
    let cwd = if settings.sampling.command.is_some() {
        workflow_dir.to_path_buf()
    } else {
        workflow_dir.join(MODEL_DIR)
    };

    let mut command = ModelCommand::from_argv(&argv, cwd)?;
    command.envs.extend(model_env(experiment, settings.is_sync(), &data_dir));
    if settings.sampling.command.is_none() {
        let path = std::env::var("PATH").unwrap_or_default();
        command.envs.push(("PATH".to_string(), format!("{path}:{JULIA_BIN_DIR}")));
    }

    let mut handler = ModelRunHandler::new(command);
    let mut forwarder = None;
    if let Some(experiment) = experiment {
        handler = handler.with_sync(
            SyncConfig::new(data_dir).with_interval(interval),
            experiment.client.clone(),
            experiment.run.clone(),
        );
        if std::env::var_os("JULIA_DEBUG").is_none() {
            let (tx, task) = spawn_output_forwarder(experiment);
            handler = handler.forward_output(tx);
            forwarder = Some(task);
        }
    }

    let outcome = handler.run().await?;
    if let Some(task) = forwarder {
        if let Err(err) = task.await {
            warn!("output forwarder failed: {err}");
        }
    }

    if let Some(experiment) = experiment {
        if let Some(message) = outcome.error_message() {
            experiment.send("experiment:error", Some(json!(message))).await;
        }
        experiment.set_status(outcome.status.as_str()).await?;
        experiment.send("experiment:finish", None).await;
        if outcome.status == RunStatus::SampleFin {
            let run = &experiment.run;
            experiment
                .client
                .call_after_sample_lambda(&run.experiment_id, &run.batch_id, &run.run_id)
                .await;
        }
    }
    Ok(outcome)
}

async fn run_data_script(workflow_dir: &Path, experiment: Option<&Experiment>) -> Result<()> {
    info!("Running script: {DATA_SCRIPT}");
    let argv = ["uv", "run", "--script", DATA_SCRIPT].map(String::from);
    let mut command = ModelCommand::from_argv(&argv, workflow_dir.to_path_buf())?;
    command.envs.extend(data_script_env(workflow_dir, experiment));

    let mut handler = ModelRunHandler::<ApiClient>::new(command);
    let mut forwarder = None;
    if let Some(experiment) = experiment {
        let (tx, task) = spawn_output_forwarder(experiment);
        handler = handler.forward_output(tx);
        forwarder = Some(task);
    }
    let outcome = handler.run().await?;
    if let Some(task) = forwarder {
        if let Err(err) = task.await {
            warn!("output forwarder failed: {err}");
        }
    }

    if outcome.status != RunStatus::SampleFin {
        bail!(
            "run data script failed: {}",
            outcome.error_message().unwrap_or_default()
        );
    }
    Ok(())
}

fn data_script_env(workflow_dir: &Path, experiment: Option<&Experiment>) -> Vec<(String, String)> {
    let mut envs = vec![(
        "PYTHONPATH".to_string(),
        workflow_dir.join("client").join("Coinfer.py").display().to_string(),
    )];
    if let Some(experiment) = experiment {
        envs.push(("WORKFLOW_ID".to_string(), experiment.workflow_id.clone()));
        envs.push(("COINFER_SERVER_ENDPOINT".to_string(), experiment.endpoint.clone()));
        envs.push(("COINFER_AUTH_TOKEN".to_string(), experiment.token.clone()));
    }
    if let Ok(efs_dir) = std::env::var("EFS_DIR") {
        envs.push(("UV_CACHE_DIR".to_string(), format!("{efs_dir}/uv_cache")));
    }
    envs
}

/// Variables the sampler reads to find its run and data directory.
fn model_env(experiment: Option<&Experiment>, is_sync: bool, data_dir: &Path) -> Vec<(String, String)> {
    let (experiment_id, batch_id, run_id, workflow_id, token, endpoint) = match experiment {
        Some(e) => (
            e.run.experiment_id.clone(),
            e.run.batch_id.clone(),
            e.run.run_id.clone(),
            e.workflow_id.clone(),
            e.token.clone(),
            e.endpoint.clone(),
        ),
        None => Default::default(),
    };
    vec![
        ("EXPERIMENT_ID".to_string(), experiment_id),
        ("BATCH_ID".to_string(), batch_id),
        ("RUN_ID".to_string(), run_id),
        ("WORKFLOW_ID".to_string(), workflow_id),
        (
            "COINFER_SYNC".to_string(),
            if is_sync { "TRUE" } else { "FALSE" }.to_string(),
        ),
        ("COINFER_AUTH_TOKEN".to_string(), token),
        ("COINFER_SERVER_ENDPOINT".to_string(), endpoint),
        (
            "COINFER_MCMC_DATA_PATH".to_string(),
            data_dir.display().to_string(),
        ),
    ]
}

/// `sampling.command` when set, otherwise the Julia invocation that runs
/// the model's entrance file followed by `model/script.jl`.
fn model_argv(workflow_dir: &Path, settings: &WorkflowSettings) -> Result<Vec<String>> {
    if let Some(command) = &settings.sampling.command {
        return Ok(command.clone());
    }

    let model_dir = workflow_dir.join(MODEL_DIR);
    let metadata_path = model_dir.join(MODEL_METADATA);
    let metadata: ModelMetadata = serde_json::from_str(
        &std::fs::read_to_string(&metadata_path)
            .with_context(|| format!("failed to read {}", metadata_path.display()))?,
    )
    .with_context(|| format!("failed to parse {}", metadata_path.display()))?;

    let setup = if model_dir.join("Manifest.toml").is_file() {
        "using Pkg\nPkg.resolve()"
    } else {
        "using Pkg\nPkg.instantiate(;verbose=true)"
    };
    let script = [
        setup.to_string(),
        read_model_file(&model_dir.join(&metadata.entrance_file))?,
        read_model_file(&model_dir.join(MODEL_SCRIPT))?,
    ]
    .join("\n");

    let mut argv = vec!["julia".to_string()];
    argv.extend(settings.sampling.julia_args.iter().cloned());
    argv.extend([
        "--project".to_string(),
        "-e".to_string(),
        script,
        workflow_dir.join(CLIENT_ENTRYPOINT).display().to_string(),
    ]);
    Ok(argv)
}

fn read_model_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn spawn_output_forwarder(experiment: &Experiment) -> (mpsc::UnboundedSender<String>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let client = experiment.client.clone();
    let group = experiment.group();
    let task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let message = json!({ "action": "experiment:output", "data": line });
            if let Err(err) = client.sendmsg(&group, message).await {
                warn!("failed to forward output: {err:#}");
            }
        }
    });
    (tx, task)
}

/// Log group and stream of the hosting container, when running in the cloud.
fn cloud_run_info() -> RunInfo {
    let prno = std::env::var("PRNO").unwrap_or_default();
    if let Ok(agent_uri) = std::env::var("ECS_AGENT_URI") {
        let task_id = agent_uri
            .rsplit('/')
            .next()
            .and_then(|last| last.split('-').next())
            .unwrap_or_default();
        return RunInfo {
            log_group: Some(format!("/ecs/wd-run-model-pr{prno}")),
            log_stream: Some(format!("ecs/wd-run-model/{task_id}")),
            run_on: Some("fargate".to_string()),
            ..RunInfo::default()
        };
    }
    if let Ok(stream) = std::env::var("AWS_LAMBDA_LOG_STREAM_NAME") {
        let function = std::env::var("AWS_LAMBDA_FUNCTION_NAME")
            .unwrap_or_else(|_| "JuliaSampleFunction".to_string());
        return RunInfo {
            log_group: Some(format!("/aws/lambda/{function}")),
            log_stream: Some(stream),
            run_on: Some("lambda".to_string()),
            ..RunInfo::default()
        };
    }
    RunInfo::default()
}

fn report(base: &BaseArgs, outcome: &RunOutcome, experiment: Option<&Experiment>) {
    let rows = outcome.sync.as_ref().map_or(0, |report| report.rows_ingested);
    let flushes = outcome.sync.as_ref().map_or(0, |report| report.flushes);
    if base.json {
        let summary = json!({
            "status": outcome.status.as_str(),
            "experiment_id": experiment.map(|e| e.run.experiment_id.as_str()),
            "exit_code": outcome.exit.and_then(|status| status.code()),
            "rows": rows,
            "flushes": flushes,
            "error": outcome.error_message(),
        });
        println!("{summary}");
        return;
    }

    match outcome.status {
        RunStatus::SampleFin if experiment.is_some() => print_command_status(
            CommandStatus::Success,
            &format!(
                "Sampling finished, sent {} in {}",
                pluralize(rows, "row", None),
                pluralize(flushes, "batch", Some("batches"))
            ),
        ),
        RunStatus::SampleFin => print_command_status(CommandStatus::Success, "Sampling finished"),
        RunStatus::Err => print_command_status(
            CommandStatus::Error,
            &outcome.error_message().unwrap_or_else(|| "Sampling failed".to_string()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn settings(text: &str) -> WorkflowSettings {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn julia_command_is_built_from_model_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let model = dir.path().join(MODEL_DIR);
        fs::create_dir_all(&model)?;
        fs::write(model.join(MODEL_METADATA), r#"{"entrance_file": "main.jl"}"#)?;
        fs::write(model.join("main.jl"), "model = 1")?;
        fs::write(model.join(MODEL_SCRIPT), "sample(model)")?;

        let settings = settings("sampling:\n  julia_args: [\"-t\", \"2\"]\n");
        let argv = model_argv(dir.path(), &settings)?;

        assert_eq!(&argv[..5], ["julia", "-t", "2", "--project", "-e"]);
        assert_eq!(
            argv[5],
            "using Pkg\nPkg.instantiate(;verbose=true)\nmodel = 1\nsample(model)"
        );
        assert_eq!(
            argv[6],
            dir.path().join(CLIENT_ENTRYPOINT).display().to_string()
        );

        fs::write(model.join("Manifest.toml"), "")?;
        let argv = model_argv(dir.path(), &settings)?;
        assert!(argv[5].starts_with("using Pkg\nPkg.resolve()\n"));
        Ok(())
    }

    #[test]
    fn explicit_command_wins_and_missing_metadata_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let explicit = settings("sampling:\n  command: [python, sampler.py]\n");
        assert_eq!(model_argv(dir.path(), &explicit)?, vec!["python", "sampler.py"]);

        let julia = settings("sampling: {}\n");
        let err = model_argv(dir.path(), &julia).unwrap_err();
        assert!(format!("{err:#}").contains(".metadata"));
        Ok(())
    }

    #[test]
    fn offline_run_exports_empty_ids() {
        let envs: Map<String, Value> = model_env(None, false, Path::new("/w/mcmcdata"))
            .into_iter()
            .map(|(k, v)| (k, json!(v)))
            .collect();
        assert_eq!(envs["COINFER_SYNC"], "FALSE");
        assert_eq!(envs["EXPERIMENT_ID"], "");
        assert_eq!(envs["COINFER_AUTH_TOKEN"], "");
        assert_eq!(envs["COINFER_MCMC_DATA_PATH"], "/w/mcmcdata");
        assert_eq!(envs.len(), 8);
    }
}

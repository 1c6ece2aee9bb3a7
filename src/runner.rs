use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::logging::mask_envs;
use crate::mcmc::{finish_channel, McmcSink, McmcSync, RunIds, SyncConfig, SyncReport};

pub const INTERRUPTED_MESSAGE: &str = "server terminated";
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    SampleFin,
    Err,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::SampleFin => "SAMPLE_FIN",
            RunStatus::Err => "ERR",
        }
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub exit: Option<ExitStatus>,
    pub interrupted: bool,
    pub sync: Option<SyncReport>,
    pub sync_error: Option<anyhow::Error>,
}

impl RunOutcome {
    /// Message reported to the server when the run did not finish cleanly.
    pub fn error_message(&self) -> Option<String> {
        if self.status == RunStatus::SampleFin {
            return None;
        }
        if self.interrupted {
            return Some(INTERRUPTED_MESSAGE.to_string());
        }
        if let Some(err) = &self.sync_error {
            return Some(format!("{err:#}"));
        }
        Some(match self.exit {
            Some(status) => format!("sampler exited with {status}"),
            None => "sampler did not exit".to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ModelCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub envs: Vec<(String, String)>,
}

impl ModelCommand {
    pub fn from_argv(argv: &[String], cwd: PathBuf) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("sampler command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            cwd,
            envs: Vec::new(),
        })
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

struct SyncJob<S> {
    config: SyncConfig,
    sink: S,
    run: RunIds,
}

/// Runs the sampler as a child process and, when syncing, the MCMC sync
/// loop next to it.
pub struct ModelRunHandler<S> {
    command: ModelCommand,
    sync: Option<SyncJob<S>>,
    output: Option<mpsc::UnboundedSender<String>>,
    output_drain_timeout: Duration,
}

impl<S: McmcSink> ModelRunHandler<S> {
    pub fn new(command: ModelCommand) -> Self {
        Self {
            command,
            sync: None,
            output: None,
            output_drain_timeout: OUTPUT_DRAIN_TIMEOUT,
        }
    }

    /// How long to keep reading output after the sampler exits.
    pub fn output_drain_timeout(mut self, timeout: Duration) -> Self {
        self.output_drain_timeout = timeout;
        self
    }

    pub fn with_sync(mut self, config: SyncConfig, sink: S, run: RunIds) -> Self {
        self.sync = Some(SyncJob { config, sink, run });
        self
    }

    /// Every output line of the child is also sent to `output`.
    pub fn forward_output(mut self, output: mpsc::UnboundedSender<String>) -> Self {
        self.output = Some(output);
        self
    }

    pub async fn run(self) -> Result<RunOutcome> {
        self.run_until(shutdown_signal()).await
    }

    /// Like [`run`](Self::run), with `interrupt` standing in for SIGINT and
    /// SIGTERM.
    pub async fn run_until<F>(self, interrupt: F) -> Result<RunOutcome>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ModelCommand {
            program,
            args,
            cwd,
            envs,
        } = self.command;

        debug!(envs = ?mask_envs(envs.iter().map(|(k, v)| (k, v))), "sampler environment");
        info!("run model: {program} {}", args.join(" "));

        let mut child = Command::new(&program)
            .args(&args)
            .current_dir(&cwd)
            .envs(envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start sampler `{program}`"))?;

        let mut output_tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            output_tasks.push(spawn_output_task(stdout, self.output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            output_tasks.push(spawn_output_task(stderr, self.output));
        }

        let (trigger, finished) = finish_channel();
        let sync_task = self.sync.map(|job| {
            tokio::spawn(McmcSync::new(job.config, job.sink, job.run, finished).run())
        });

        let interrupted = Arc::new(AtomicBool::new(false));
        let interrupted_signal = Arc::clone(&interrupted);
        let (interrupt_tx, mut interrupt_rx) = oneshot::channel::<()>();
        let signal_task = tokio::spawn(async move {
            interrupt.await;
            interrupted_signal.store(true, Ordering::SeqCst);
            let _ = interrupt_tx.send(());
        });

        let exit = tokio::select! {
            status = child.wait() => status,
            Ok(()) = &mut interrupt_rx => {
                warn!("interrupted, stopping sampler");
                if let Err(err) = child.start_kill() {
                    warn!("failed to kill sampler: {err}");
                }
                child.wait().await
            }
        };
        signal_task.abort();
        let exit = match exit {
            Ok(status) => Some(status),
            Err(err) => {
                error!("failed to wait for sampler: {err}");
                None
            }
        };
        debug!(?exit, "sampler exited");

        trigger.finish();

        let (sync, sync_error) = match sync_task {
            None => (None, None),
            Some(handle) => match handle.await {
                Ok(Ok(report)) => (Some(report), None),
                Ok(Err(err)) => {
                    error!("mcmc sync failed: {err:#}");
                    (None, Some(err))
                }
                Err(join) => {
                    error!("mcmc sync task failed: {join}");
                    (None, Some(anyhow!("mcmc sync task failed: {join}")))
                }
            },
        };

        // a surviving grandchild can hold the pipes open
        for mut task in output_tasks {
            match tokio::time::timeout(self.output_drain_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("output reader failed: {err}"),
                Err(_) => {
                    warn!("sampler output still open after exit, detaching reader");
                    task.abort();
                }
            }
        }

        let interrupted = interrupted.load(Ordering::SeqCst);
        let clean_exit = exit.is_some_and(|status| status.success());
        let status = if clean_exit && !interrupted && sync_error.is_none() {
            RunStatus::SampleFin
        } else {
            RunStatus::Err
        };

        Ok(RunOutcome {
            status,
            exit,
            interrupted,
            sync,
            sync_error,
        })
    }
}

fn spawn_output_task<R>(stream: R, output: Option<mpsc::UnboundedSender<String>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    info!("-->{line}");
                    if let Some(output) = &output {
                        let _ = output.send(line);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("failed to read sampler output: {err}");
                    break;
                }
            }
        }
    })
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if result.is_err() {
                            std::future::pending::<()>().await;
                        }
                    }
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::mcmc::testing::RecordingSink;
    use crate::mcmc::{FileCheckpoint, Scalar};

    fn shell(script: &str, cwd: &Path) -> ModelCommand {
        ModelCommand::from_argv(
            &["sh".to_string(), "-c".to_string(), script.to_string()],
            cwd.to_path_buf(),
        )
        .unwrap()
    }

    fn run_ids() -> RunIds {
        RunIds {
            experiment_id: "exp".to_string(),
            batch_id: "b".to_string(),
            run_id: "r".to_string(),
        }
    }

    fn sync_config(dir: &Path) -> SyncConfig {
        let mut config = SyncConfig::new(dir.to_path_buf()).with_interval(Duration::from_millis(20));
        config.dir_wait_interval = Duration::from_millis(10);
        config
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(ModelCommand::from_argv(&[], PathBuf::from(".")).is_err());
    }

    #[tokio::test]
    async fn ships_draws_written_by_the_sampler() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let data_dir = dir.path().join("mcmcdata");
        let script = "mkdir -p \"$COINFER_MCMC_DATA_PATH\" \
             && printf 'c1,mu,1,0.5\\nc1,mu,2,0.7\\n' > \"$COINFER_MCMC_DATA_PATH/chain1.csv\" \
             && echo sampled";
        let command = shell(script, dir.path())
            .env("COINFER_MCMC_DATA_PATH", data_dir.display().to_string());

        let sink = RecordingSink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = ModelRunHandler::new(command)
            .with_sync(sync_config(&data_dir), sink.clone(), run_ids())
            .forward_output(tx)
            .run_until(std::future::pending())
            .await?;

        assert_eq!(outcome.status, RunStatus::SampleFin);
        assert!(!outcome.interrupted);
        assert_eq!(outcome.error_message(), None);
        assert_eq!(rx.recv().await.as_deref(), Some("sampled"));

        let sent = sink.sent();
        let values: Vec<Scalar> = sent
            .iter()
            .flat_map(|(_, batch)| batch.vars["c1"]["mu"].clone())
            .collect();
        assert_eq!(values, vec![Scalar::Float(0.5), Scalar::Float(0.7)]);
        assert!(sent.iter().all(|(ids, _)| *ids == run_ids()));

        let report = outcome.sync.expect("sync report");
        assert_eq!(report.rows_ingested, 2);
        assert_eq!(
            report.index.get("chain1.csv"),
            FileCheckpoint {
                size: 24,
                lines_consumed: 2
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn failing_sampler_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let outcome = ModelRunHandler::<RecordingSink>::new(shell("echo boom >&2; exit 3", dir.path()))
            .run_until(std::future::pending())
            .await?;

        assert_eq!(outcome.status, RunStatus::Err);
        assert_eq!(outcome.exit.and_then(|s| s.code()), Some(3));
        assert!(outcome.error_message().unwrap().contains("exited"));
        Ok(())
    }

    #[tokio::test]
    async fn sync_failure_fails_a_clean_exit() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir)?;
        std::fs::write(data_dir.join("a.csv"), "c1,mu,1,0.5\n")?;

        let outcome = ModelRunHandler::new(shell("true", dir.path()))
            .with_sync(sync_config(&data_dir), RecordingSink::failing(), run_ids())
            .run_until(std::future::pending())
            .await?;

        assert_eq!(outcome.status, RunStatus::Err);
        assert!(outcome.exit.is_some_and(|s| s.success()));
        assert!(outcome.sync_error.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn interrupt_kills_sampler_and_still_flushes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir)?;
        std::fs::write(data_dir.join("a.csv"), "c1,mu,1,0.5\nc1,mu,2,0.6\n")?;

        let sink = RecordingSink::default();
        let outcome = ModelRunHandler::new(shell("exec sleep 30", dir.path()))
            .with_sync(sync_config(&data_dir), sink.clone(), run_ids())
            .run_until(tokio::time::sleep(Duration::from_millis(100)))
            .await?;

        assert!(outcome.interrupted);
        assert_eq!(outcome.status, RunStatus::Err);
        assert_eq!(outcome.error_message().as_deref(), Some(INTERRUPTED_MESSAGE));

        let flushed: usize = sink.sent().iter().map(|(_, b)| b.value_count()).sum();
        assert_eq!(flushed, 2);
        assert!(data_dir.join(crate::mcmc::HANDLED_FILE_NAME).is_file());
        Ok(())
    }

    #[tokio::test]
    async fn lingering_grandchild_does_not_block_finish() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir)?;
        std::fs::write(data_dir.join("a.csv"), "c1,mu,1,0.5\n")?;

        let sink = RecordingSink::default();
        let started = std::time::Instant::now();
        let outcome = ModelRunHandler::new(shell("sleep 20 & exec sleep 20", dir.path()))
            .with_sync(sync_config(&data_dir), sink.clone(), run_ids())
            .output_drain_timeout(Duration::from_millis(200))
            .run_until(tokio::time::sleep(Duration::from_millis(100)))
            .await?;

        assert!(outcome.interrupted);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.sync.map(|report| report.rows_ingested), Some(1));
        assert_eq!(sink.sent().len(), 1);
        Ok(())
    }
}

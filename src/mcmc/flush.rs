use std::future::Future;

use tracing::{debug, info};

use super::aggregate::Batch;
use super::error::SyncError;

/// Identifies the experiment run the draws belong to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunIds {
    pub experiment_id: String,
    pub batch_id: String,
    pub run_id: String,
}

/// Remote destination for MCMC draws. Retries, if any, belong to the
/// implementation; an error here fails the sync task.
pub trait McmcSink: Send + Sync + 'static {
    fn send_mcmc_data(
        &self,
        experiment_id: &str,
        batch_id: &str,
        run_id: &str,
        payload: &Batch,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Append every series of `current` onto `accumulator`, widen the iteration
/// windows, and leave `current` empty.
pub fn merge(current: &mut Batch, accumulator: &mut Batch) {
    for (chain, variables) in std::mem::take(&mut current.vars) {
        let target = accumulator.vars.entry(chain).or_default();
        for (variable, values) in variables {
            target.entry(variable).or_default().extend(values);
        }
    }
    for (chain, range) in std::mem::take(&mut current.iterations) {
        accumulator.widen_range(&chain, range);
    }
}

/// Send the accumulator as one message and clear it. Returns whether
/// anything was sent; an empty accumulator is a no-op.
pub async fn flush<S: McmcSink>(
    accumulator: &mut Batch,
    sink: &S,
    run: &RunIds,
) -> Result<bool, SyncError> {
    if accumulator.is_empty() {
        return Ok(false);
    }
    accumulator.check_consistent()?;

    for (chain, variables) in &accumulator.vars {
        info!(chain = %chain, variables = variables.len(), "send mcmc data");
    }
    sink.send_mcmc_data(&run.experiment_id, &run.batch_id, &run.run_id, accumulator)
        .await
        .map_err(|source| SyncError::Transport {
            experiment_id: run.experiment_id.clone(),
            source: source.into(),
        })?;

    debug!(values = accumulator.value_count(), "flushed mcmc batch");
    accumulator.clear();
    Ok(true)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use anyhow::bail;

    use super::*;

    /// Sink that keeps every payload it receives.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingSink {
        sent: Arc<Mutex<Vec<(RunIds, Batch)>>>,
        fail: bool,
    }

    impl RecordingSink {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn sent(&self) -> Vec<(RunIds, Batch)> {
            self.sent
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
        }
    }

    impl McmcSink for RecordingSink {
        async fn send_mcmc_data(
            &self,
            experiment_id: &str,
            batch_id: &str,
            run_id: &str,
            payload: &Batch,
        ) -> anyhow::Result<()> {
            if self.fail {
                bail!("server unreachable");
            }
            let run = RunIds {
                experiment_id: experiment_id.to_string(),
                batch_id: batch_id.to_string(),
                run_id: run_id.to_string(),
            };
            self.sent
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push((run, payload.clone()));
            Ok(())
        }
    }
}

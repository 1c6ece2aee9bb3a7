use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::aggregate::Aggregator;
use super::finish::FinishSignal;
use super::flush::{flush, McmcSink, RunIds};
use super::reader::{file_name_of, list_data_files, read_new_lines, HandledIndex};

pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_secs(3);
pub const DATA_DIR_WAIT_INTERVAL: Duration = Duration::from_secs(1);
pub const SEND_INTERVAL_ENV: &str = "COINFER_DATA_SENDING_INTERVAL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    WaitingForDataDir,
    Polling,
    Finishing,
    Done,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    /// Pause between poll passes; also the flush cadence.
    pub interval: Duration,
    pub dir_wait_interval: Duration,
}

impl SyncConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            interval: DEFAULT_SEND_INTERVAL,
            dir_wait_interval: DATA_DIR_WAIT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Read the send interval (whole seconds) from the environment.
pub fn interval_from_env() -> Result<Duration> {
    match std::env::var(SEND_INTERVAL_ENV) {
        Ok(value) => {
            let secs = value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{SEND_INTERVAL_ENV} must be whole seconds, got {value:?}"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(DEFAULT_SEND_INTERVAL),
    }
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub states: Vec<SyncState>,
    pub rows_ingested: usize,
    pub flushes: usize,
    pub index: HandledIndex,
}

/// Tails the sampler's data directory and ships draws to the sink until the
/// finished signal is raised.
pub struct McmcSync<S> {
    config: SyncConfig,
    sink: S,
    run: RunIds,
    finished: FinishSignal,
    aggregator: Aggregator,
    index: Option<HandledIndex>,
    states: Vec<SyncState>,
    flushes: usize,
}

impl<S: McmcSink> McmcSync<S> {
    pub fn new(config: SyncConfig, sink: S, run: RunIds, finished: FinishSignal) -> Self {
        Self {
            config,
            sink,
            run,
            finished,
            aggregator: Aggregator::new(),
            index: None,
            states: Vec::new(),
            flushes: 0,
        }
    }

    pub async fn run(mut self) -> Result<SyncReport> {
        debug!(data_dir = %self.config.data_dir.display(), "syncing MCMC data");

        self.enter(SyncState::WaitingForDataDir);
        if self.wait_for_data_dir().await {
            self.enter(SyncState::Polling);
            self.load_index()?;
            loop {
                if self.finished.is_finished() {
                    break;
                }
                self.poll_pass(false)?;
                self.flush_accumulated().await?;
                if self.finished.sleep(self.config.interval).await {
                    break;
                }
            }
        }

        self.enter(SyncState::Finishing);
        self.finish().await?;
        self.enter(SyncState::Done);

        debug!(
            rows = self.aggregator.rows_ingested(),
            flushes = self.flushes,
            "done syncing MCMC data"
        );
        Ok(SyncReport {
            states: self.states,
            rows_ingested: self.aggregator.rows_ingested(),
            flushes: self.flushes,
            index: self.index.unwrap_or_default(),
        })
    }

    /// Read every data file once, in name order, feeding new lines to the
    /// aggregator. Returns how many files had new content.
    ///
    /// Outside of `drain` the pass stops early once the finished signal is
    /// raised; the final drain reads everything, including a trailing line
    /// without a newline.
    pub fn poll_pass(&mut self, drain: bool) -> Result<usize> {
        let files = list_data_files(&self.config.data_dir)?;
        let index = self.index.get_or_insert_with(HandledIndex::default);
        let mut files_read = 0;

        for path in files {
            if !drain && self.finished.is_finished() {
                debug!("sampling finished during poll pass");
                break;
            }
            let name = file_name_of(&path)?;
            let checkpoint = index.get(&name);
            let Some(chunk) = read_new_lines(&path, checkpoint, drain)? else {
                continue;
            };

            debug!(file = %name, ?checkpoint, lines = chunk.lines.len(), "handling file");
            self.aggregator.ingest(&path, &chunk)?;
            index.record(&name, chunk.checkpoint);
            files_read += 1;
            debug!(file = %name, checkpoint = ?chunk.checkpoint, "finish handle file");
        }
        Ok(files_read)
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn index(&self) -> Option<&HandledIndex> {
        self.index.as_ref()
    }

    pub fn load_index(&mut self) -> Result<()> {
        if self.index.is_none() {
            let path = HandledIndex::path_in(&self.config.data_dir);
            let index = HandledIndex::load(&path)?;
            if !index.is_empty() {
                info!(files = index.len(), "resuming from {}", path.display());
            }
            self.index = Some(index);
        }
        Ok(())
    }

    async fn wait_for_data_dir(&mut self) -> bool {
        loop {
            if self.config.data_dir.is_dir() {
                return true;
            }
            if self.finished.is_finished() {
                debug!("sampling finished before data directory appeared");
                return false;
            }
            self.finished.sleep(self.config.dir_wait_interval).await;
        }
    }

    async fn flush_accumulated(&mut self) -> Result<()> {
        if flush(self.aggregator.accumulated_mut(), &self.sink, &self.run).await? {
            self.flushes += 1;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let dir_exists = self.config.data_dir.is_dir();
        if dir_exists {
            self.load_index()?;
            self.poll_pass(true)?;
        }

        self.aggregator.close_pending();
        self.flush_accumulated().await?;

        if dir_exists {
            if let Some(index) = &self.index {
                index.save(&HandledIndex::path_in(&self.config.data_dir))?;
            }
        }
        Ok(())
    }

    fn enter(&mut self, state: SyncState) {
        debug!(?state, "mcmc sync state");
        self.states.push(state);
    }
}

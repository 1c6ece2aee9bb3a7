use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use super::error::SyncError;
use super::flush::merge;
use super::reader::NewLines;
use super::value::{ConverterCache, Scalar};

/// chain name -> variable name -> values in encounter order
pub type ChainTable = BTreeMap<String, BTreeMap<String, Vec<Scalar>>>;
/// chain name -> observed iteration window
pub type IterationRanges = BTreeMap<String, IterationRange>;

/// Smallest and largest iteration seen for a chain. Sent as `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "(i64, i64)")]
pub struct IterationRange {
    pub min: i64,
    pub max: i64,
}

impl IterationRange {
    pub fn single(iteration: i64) -> Self {
        Self {
            min: iteration,
            max: iteration,
        }
    }

    pub fn widen(&mut self, other: IterationRange) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

impl From<IterationRange> for (i64, i64) {
    fn from(range: IterationRange) -> Self {
        (range.min, range.max)
    }
}

/// Draws grouped by chain and variable, plus the iteration window they span.
/// Serializes to the `{vars, iteration}` payload the server expects.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Batch {
    pub vars: ChainTable,
    #[serde(rename = "iteration")]
    pub iterations: IterationRanges,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty() && self.iterations.is_empty()
    }

    pub fn clear(&mut self) {
        self.vars.clear();
        self.iterations.clear();
    }

    pub fn push(&mut self, chain: &str, variable: &str, iteration: i64, value: Scalar) {
        self.vars
            .entry(chain.to_string())
            .or_default()
            .entry(variable.to_string())
            .or_default()
            .push(value);
        self.widen_range(chain, IterationRange::single(iteration));
    }

    pub fn widen_range(&mut self, chain: &str, range: IterationRange) {
        self.iterations
            .entry(chain.to_string())
            .and_modify(|existing| existing.widen(range))
            .or_insert(range);
    }

    /// Every variable of a chain must carry the same number of draws.
    pub fn check_consistent(&self) -> Result<(), SyncError> {
        for (chain, variables) in &self.vars {
            let mut lengths = variables.values().map(Vec::len);
            let Some(first) = lengths.next() else {
                continue;
            };
            if lengths.any(|len| len != first) {
                return Err(SyncError::StructuralInconsistency {
                    chain: chain.clone(),
                    lengths: variables
                        .iter()
                        .map(|(name, values)| (name.clone(), values.len()))
                        .collect(),
                });
            }
        }
        Ok(())
    }

    /// Remove one chain's series and window into a batch of their own.
    pub fn take_chain(&mut self, chain: &str) -> Batch {
        let mut taken = Batch::default();
        if let Some(variables) = self.vars.remove(chain) {
            taken.vars.insert(chain.to_string(), variables);
        }
        if let Some(range) = self.iterations.remove(chain) {
            taken.iterations.insert(chain.to_string(), range);
        }
        taken
    }

    pub fn value_count(&self) -> usize {
        self.vars
            .values()
            .flat_map(|variables| variables.values())
            .map(Vec::len)
            .sum()
    }
}

/// One `chain_name,var_name,iteration_number,var_value` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    pub chain: String,
    pub variable: String,
    pub iteration: i64,
    pub raw_value: String,
}

impl DataRow {
    pub fn parse(line: &str, file: &Path, line_number: usize) -> Result<Self, SyncError> {
        let malformed = |reason: String| SyncError::MalformedRow {
            file: file.to_path_buf(),
            line: line_number,
            reason,
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(line.as_bytes());
        let mut record = csv::StringRecord::new();
        match reader.read_record(&mut record) {
            Ok(true) => {}
            Ok(false) => return Err(malformed("empty line".to_string())),
            Err(err) => return Err(malformed(err.to_string())),
        }
        if record.len() != 4 {
            return Err(malformed(format!(
                "expected 4 fields, found {}",
                record.len()
            )));
        }

        let iteration = record[2]
            .trim()
            .parse::<i64>()
            .map_err(|_| malformed(format!("iteration {:?} is not an integer", &record[2])))?;

        Ok(Self {
            chain: record[0].to_string(),
            variable: record[1].to_string(),
            iteration,
            raw_value: record[3].to_string(),
        })
    }
}

/// Groups parsed rows into the per-poll batch and moves a chain's pending
/// iteration into the accumulator once that chain rolls over.
///
/// Rollover is detected against the immediately preceding row of the same
/// read, not a running maximum, so each file is expected to be written in
/// iteration order. Only the rolling chain is merged; other chains keep
/// their unfinished iteration pending.
#[derive(Debug, Default)]
pub struct Aggregator {
    converters: ConverterCache,
    pending: Batch,
    accumulated: Batch,
    rows_ingested: usize,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest the new lines of one file. Returns how many rollovers moved
    /// a chain's pending iteration into the accumulator.
    pub fn ingest(&mut self, file: &Path, chunk: &NewLines) -> Result<usize, SyncError> {
        let mut previous_iteration: Option<i64> = None;
        let mut rollovers = 0;

        for (offset, line) in chunk.lines.iter().enumerate() {
            let row = DataRow::parse(line, file, chunk.first_line + offset)?;

            if previous_iteration.is_some_and(|previous| row.iteration > previous) {
                let mut completed = self.pending.take_chain(&row.chain);
                merge(&mut completed, &mut self.accumulated);
                rollovers += 1;
            }
            previous_iteration = Some(row.iteration);

            let value = self.converters.convert(&row.variable, &row.raw_value)?;
            self.pending
                .push(&row.chain, &row.variable, row.iteration, value);
            self.rows_ingested += 1;
        }

        Ok(rollovers)
    }

    /// Move whatever is still pending into the accumulator.
    pub fn close_pending(&mut self) {
        merge(&mut self.pending, &mut self.accumulated);
    }

    pub fn pending(&self) -> &Batch {
        &self.pending
    }

    pub fn accumulated(&self) -> &Batch {
        &self.accumulated
    }

    pub fn accumulated_mut(&mut self) -> &mut Batch {
        &mut self.accumulated
    }

    pub fn rows_ingested(&self) -> usize {
        self.rows_ingested
    }
}

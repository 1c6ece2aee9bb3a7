use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

use super::value::ValueKind;

/// Failures that abort the MCMC sync task.
///
/// Every variant is fatal for the current run: the sync loop stops, the
/// runner marks the experiment as failed and the process exits non-zero.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("malformed MCMC row in {file}:{line}: {reason}")]
    MalformedRow {
        file: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("cannot convert {raw:?} for variable {variable:?} (typed as {kind} from its first value)")]
    ValueConversion {
        variable: String,
        kind: ValueKind,
        raw: String,
    },

    #[error("chain {chain:?} has variables of unequal length: {lengths:?}")]
    StructuralInconsistency {
        chain: String,
        lengths: BTreeMap<String, usize>,
    },

    #[error("failed to send MCMC data for experiment {experiment_id}")]
    Transport {
        experiment_id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

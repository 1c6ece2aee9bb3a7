//! Incremental synchronisation of MCMC draws.
//!
//! The sampler appends `chain,variable,iteration,value` rows to CSV files in a
//! data directory while it runs. [`McmcSync`] tails those files, groups rows
//! per chain and variable, and ships completed iterations to a [`McmcSink`]
//! on a fixed cadence until the [`FinishSignal`] is raised.

mod aggregate;
mod error;
mod finish;
mod flush;
mod reader;
mod sync;
mod value;

pub use aggregate::Batch;
pub use finish::finish_channel;
pub use flush::{McmcSink, RunIds};
pub use sync::{interval_from_env, McmcSync, SyncConfig, SyncReport};

#[cfg(test)]
pub(crate) use flush::testing;
#[cfg(test)]
pub(crate) use reader::{FileCheckpoint, HANDLED_FILE_NAME};
#[cfg(test)]
pub(crate) use value::Scalar;

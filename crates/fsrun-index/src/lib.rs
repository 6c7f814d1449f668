//! Aggregation of many run directories into one queryable index file.
//!
//! [`aggregate`] sweeps a tree of run directories and writes a
//! [`JsonIndex`]; [`RunIndex`] opens such a file for querying and loads
//! stored result payloads relative to the tree the sweep started from.

use fsrun_core::StoreError;
use std::path::PathBuf;

pub mod reader;
pub mod store;
pub mod sweep;

pub use reader::{field_equals, with_status, RunIndex};
pub use store::{IndexDocument, IndexStore, JsonIndex, INDEX_SCHEMA_VERSION};
pub use sweep::{
    aggregate, aggregate_with_log, AggregateOptions, AggregateReport, SweepFailure, SweepLog,
    TracingSweepLog,
};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("destination {} already exists; pass overwrite to replace it", .0.display())]
    DestinationExists(PathBuf),
    #[error("invalid index file {}: {message}", path.display())]
    Format { path: PathBuf, message: String },
    #[error("result {key:?} is not a stored file reference")]
    UnresolvedResult { key: String },
    #[error("completed run has no result mapping")]
    MissingResults,
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T, E = IndexError> = std::result::Result<T, E>;

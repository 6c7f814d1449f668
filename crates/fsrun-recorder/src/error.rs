use fsrun_core::{RunStatus, StoreError};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("recorder already started run {0}")]
    AlreadyStarted(String),
    #[error("no run has been started on this recorder")]
    NotStarted,
    #[error("run id {0:?} must be a plain directory name")]
    InvalidRunId(String),
    #[error("run directory already exists: {}", .0.display())]
    RunDirExists(PathBuf),
    #[error("cannot {op} a run whose status is {status}")]
    InvalidTransition { op: &'static str, status: RunStatus },
    #[error("experiments must return a mapping of result keys to values, got {0}")]
    ResultNotMapping(&'static str),
    #[error("result key {0:?} cannot be used as a file name")]
    InvalidResultKey(String),
    #[error("{0:?} is not an interruption status")]
    InvalidStatusLabel(String),
    #[error("result payload {0:?} already exists in the run directory")]
    ResultFileTaken(String),
    #[error("artifact name {0:?} must be a plain, unreserved file name")]
    InvalidArtifactName(String),
    #[error("artifact {0:?} would replace an existing file of the run")]
    ArtifactExists(String),
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("reading child output failed: {0}")]
    ChildOutput(#[source] std::io::Error),
    #[error("this store does not support queued runs")]
    QueueingUnsupported,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T, E = RecorderError> = std::result::Result<T, E>;

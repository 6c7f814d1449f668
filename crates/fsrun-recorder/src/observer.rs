use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::{RecorderError, Result};

/// Ordering hint for frameworks that drive several observers.
pub const DEFAULT_PRIORITY: i32 = 20;

/// Static description of the runnable unit, as supplied by the framework.
#[derive(Debug, Clone, Default)]
pub struct ExperimentInfo {
    pub name: String,
    pub base_dir: PathBuf,
    /// Source files relative to `base_dir`.
    pub sources: Vec<PathBuf>,
    pub dependencies: Vec<String>,
    pub mainfile: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunStart {
    pub experiment: ExperimentInfo,
    pub command: String,
    pub host: Value,
    pub start_time: DateTime<Utc>,
    pub config: Value,
    pub meta: Value,
    /// Directory name to use instead of a generated one.
    pub run_id: Option<String>,
}

/// Lifecycle callbacks invoked by a run orchestrating framework, in the
/// order `start`, `heartbeat`*, then one of `complete`, `interrupt` or
/// `fail`. Resources and artifacts may be reported at any point after
/// `start`.
pub trait RunObserver {
    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    fn enqueue(&mut self, _run: RunStart) -> Result<String> {
        Err(RecorderError::QueueingUnsupported)
    }

    /// Returns the identifier of the new run.
    fn start(&mut self, run: RunStart) -> Result<String>;

    fn heartbeat(
        &mut self,
        info: &Value,
        captured_output: &str,
        beat_time: DateTime<Utc>,
        result: Value,
    ) -> Result<()>;

    fn complete(&mut self, stop_time: DateTime<Utc>, result: Value) -> Result<()>;

    fn interrupt(&mut self, interrupt_time: DateTime<Utc>, status: &str) -> Result<()>;

    fn fail(&mut self, fail_time: DateTime<Utc>, fail_trace: &str) -> Result<()>;

    fn record_resource(&mut self, path: &Path) -> Result<()>;

    fn record_artifact(&mut self, name: &str, source: &Path) -> Result<()>;
}

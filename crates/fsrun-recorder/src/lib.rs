//! Filesystem run recorder.
//!
//! A [`RunRecorder`] owns one base directory and records a single run into
//! its own subdirectory. Every lifecycle event rewrites `run.json` in full,
//! so the file on disk is always the latest complete snapshot. Sources and
//! resources go through the base directory's content stores and are shared
//! across runs; artifacts and result payloads belong to the run.

use chrono::{DateTime, Utc};
use fsrun_core::{
    atomic_write_bytes, ensure_dir, result_file_name, write_canonical_json,
    write_compressed_json, ContentStore, ExperimentEntry, PathContext, RunRecord, RunStatus,
    StoreError, StoredRef, COUT_FILENAME, INFO_FILENAME, RECORD_FILENAME, RESOURCES_DIRNAME,
    SOURCES_DIRNAME,
};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub mod error;
pub mod observer;
pub mod process;

pub use error::{RecorderError, Result};
pub use observer::{ExperimentInfo, RunObserver, RunStart, DEFAULT_PRIORITY};
pub use process::{record_command, CommandOutcome, CommandRun};

const RESERVED_NAMES: [&str; 3] = [RECORD_FILENAME, COUT_FILENAME, INFO_FILENAME];
const REJECTED_INTERRUPT_LABELS: [&str; 4] = ["RUNNING", "COMPLETED", "FAILED", "QUEUED"];

#[derive(Debug, Clone)]
pub struct RecorderOptions {
    /// Defaults to `<base>/_resources`.
    pub resource_dir: Option<PathBuf>,
    /// Defaults to `<base>/_sources`.
    pub source_dir: Option<PathBuf>,
    pub priority: i32,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            resource_dir: None,
            source_dir: None,
            priority: DEFAULT_PRIORITY,
        }
    }
}

#[derive(Debug)]
struct ActiveRun {
    run_id: String,
    dir: PathBuf,
    record: RunRecord,
}

impl ActiveRun {
    fn flush(&self) -> Result<()> {
        self.record.save(&self.dir.join(RECORD_FILENAME))?;
        Ok(())
    }

    /// True when `name` is the payload file of a stored result.
    fn holds_result_payload(&self, name: &str) -> bool {
        self.record.status == RunStatus::Completed
            && self
                .record
                .result
                .as_ref()
                .and_then(Value::as_object)
                .is_some_and(|m| m.values().any(|v| v.as_str() == Some(name)))
    }

    fn write_cout(&self, captured: &str) -> Result<()> {
        atomic_write_bytes(&self.dir.join(COUT_FILENAME), captured.as_bytes())?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct RunRecorder {
    base_dir: PathBuf,
    sources: ContentStore,
    resources: ContentStore,
    priority: i32,
    active: Option<ActiveRun>,
}

impl RunRecorder {
    /// Creates the base directory if needed. Nothing else is written until
    /// a run starts.
    pub fn create(base_dir: impl Into<PathBuf>, options: RecorderOptions) -> Result<Self> {
        let base_dir = base_dir.into();
        ensure_dir(&base_dir)?;
        let resource_dir = options
            .resource_dir
            .unwrap_or_else(|| base_dir.join(RESOURCES_DIRNAME));
        let source_dir = options
            .source_dir
            .unwrap_or_else(|| base_dir.join(SOURCES_DIRNAME));
        Ok(Self {
            base_dir,
            sources: ContentStore::new(source_dir),
            resources: ContentStore::new(resource_dir),
            priority: options.priority,
            active: None,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn source_store(&self) -> &ContentStore {
        &self.sources
    }

    pub fn resource_store(&self) -> &ContentStore {
        &self.resources
    }

    pub fn run_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.run_id.as_str())
    }

    pub fn run_dir(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.dir.as_path())
    }

    pub fn record(&self) -> Option<&RunRecord> {
        self.active.as_ref().map(|a| &a.record)
    }

    fn allocate_run_dir(&self, run_id: Option<&str>) -> Result<(String, PathBuf)> {
        if let Some(id) = run_id {
            if !is_plain_file_name(id) {
                return Err(RecorderError::InvalidRunId(id.to_string()));
            }
            let dir = self.base_dir.join(id);
            return match fs::create_dir(&dir) {
                Ok(()) => Ok((id.to_string(), dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    Err(RecorderError::RunDirExists(dir))
                }
                Err(source) => Err(StoreError::Io { path: dir, source }.into()),
            };
        }
        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("run_{}", stamp)
            } else {
                format!("run_{}_{}", stamp, attempt)
            };
            let dir = self.base_dir.join(&name);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((name, dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(source) => return Err(StoreError::Io { path: dir, source }.into()),
            }
        }
    }

    /// Stores the sources and writes the initial record into a freshly
    /// allocated run directory.
    fn open_run(&self, run_id: String, dir: PathBuf, run: RunStart) -> Result<ActiveRun> {
        let experiment = ExperimentEntry {
            name: run.experiment.name.clone(),
            base_dir: run.experiment.base_dir.to_string_lossy().into_owned(),
            sources: self.save_sources(&run.experiment)?,
            dependencies: run.experiment.dependencies,
            mainfile: run.experiment.mainfile,
        };
        let record = RunRecord::new(
            experiment,
            run.command,
            run.host,
            run.config,
            run.meta,
            run.start_time,
        );
        let active = ActiveRun {
            run_id,
            dir,
            record,
        };
        active.flush()?;
        active.write_cout("")?;
        Ok(active)
    }

    fn relative_to_base(&self, path: &Path) -> String {
        path.strip_prefix(&self.base_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    fn save_sources(&self, info: &ExperimentInfo) -> Result<Vec<StoredRef>> {
        let mut stored = Vec::with_capacity(info.sources.len());
        for source in &info.sources {
            let file = self.sources.find_or_store(&info.base_dir.join(source))?;
            stored.push(StoredRef(
                source.to_string_lossy().into_owned(),
                self.relative_to_base(&file.path),
            ));
        }
        Ok(stored)
    }

    fn active_mut(&mut self) -> Result<&mut ActiveRun> {
        self.active.as_mut().ok_or(RecorderError::NotStarted)
    }

    fn running_mut(&mut self, op: &'static str) -> Result<&mut ActiveRun> {
        let active = self.active_mut()?;
        if active.record.status != RunStatus::Running {
            return Err(RecorderError::InvalidTransition {
                op,
                status: active.record.status.clone(),
            });
        }
        Ok(active)
    }
}

impl PartialEq for RunRecorder {
    fn eq(&self, other: &Self) -> bool {
        self.base_dir == other.base_dir
    }
}

impl Eq for RunRecorder {}

impl RunObserver for RunRecorder {
    fn priority(&self) -> i32 {
        self.priority
    }

    fn start(&mut self, run: RunStart) -> Result<String> {
        if let Some(active) = &self.active {
            return Err(RecorderError::AlreadyStarted(active.run_id.clone()));
        }
        let (run_id, dir) = self.allocate_run_dir(run.run_id.as_deref())?;
        let active = match self.open_run(run_id.clone(), dir.clone(), run) {
            Ok(active) => active,
            Err(err) => {
                let _ = fs::remove_dir_all(&dir);
                return Err(err);
            }
        };
        info!(run_id = %run_id, dir = %active.dir.display(), "run started");
        self.active = Some(active);
        Ok(run_id)
    }

    fn heartbeat(
        &mut self,
        info: &Value,
        captured_output: &str,
        beat_time: DateTime<Utc>,
        result: Value,
    ) -> Result<()> {
        let active = self.running_mut("heartbeat")?;
        let elapsed = (beat_time - active.record.start_time).num_milliseconds() as f64 / 1000.0;
        if let Some(eta) = estimate_eta(&result, elapsed) {
            active.record.set_eta(Some(eta));
        }
        active.record.heartbeat = Some(beat_time);
        active.record.set_live_result(result);

        active.write_cout(captured_output)?;
        active.flush()?;
        if !is_empty_info(info) {
            write_canonical_json(&active.dir.join(INFO_FILENAME), info)?;
        }
        debug!(run_id = %active.run_id, eta = ?active.record.eta, "heartbeat");
        Ok(())
    }

    fn complete(&mut self, stop_time: DateTime<Utc>, result: Value) -> Result<()> {
        self.running_mut("complete")?;
        let entries = match result {
            Value::Object(map) => map,
            other => return Err(RecorderError::ResultNotMapping(json_kind(&other))),
        };
        if let Some(bad) = entries.keys().find(|k| !is_plain_file_name(k)) {
            return Err(RecorderError::InvalidResultKey(bad.clone()));
        }

        let active = self.running_mut("complete")?;
        if let Some(taken) = entries
            .keys()
            .find(|k| active.dir.join(result_file_name(k)).exists())
        {
            return Err(RecorderError::ResultFileTaken(result_file_name(taken)));
        }
        let mut stored = Map::new();
        for (key, value) in entries {
            let file = result_file_name(&key);
            write_compressed_json(&active.dir.join(&file), &value)?;
            stored.insert(key, Value::String(file));
        }
        active.record.result = Some(Value::Object(stored));
        active.record.eta = None;
        active.record.stop_time = Some(stop_time);
        active.record.status = RunStatus::Completed;
        active.flush()?;
        info!(run_id = %active.run_id, "run completed");
        Ok(())
    }

    fn interrupt(&mut self, interrupt_time: DateTime<Utc>, status: &str) -> Result<()> {
        if status.is_empty() || REJECTED_INTERRUPT_LABELS.contains(&status) {
            return Err(RecorderError::InvalidStatusLabel(status.to_string()));
        }
        let active = self.running_mut("interrupt")?;
        active.record.stop_time = Some(interrupt_time);
        active.record.status = RunStatus::Interrupted(status.to_string());
        active.flush()?;
        info!(run_id = %active.run_id, status, "run interrupted");
        Ok(())
    }

    fn fail(&mut self, fail_time: DateTime<Utc>, fail_trace: &str) -> Result<()> {
        let active = self.active_mut()?;
        if !matches!(active.record.status, RunStatus::Running | RunStatus::Failed) {
            return Err(RecorderError::InvalidTransition {
                op: "fail",
                status: active.record.status.clone(),
            });
        }
        active.record.stop_time = Some(fail_time);
        active.record.status = RunStatus::Failed;
        active.record.fail_trace = Some(fail_trace.to_string());
        active.flush()?;
        info!(run_id = %active.run_id, "run failed");
        Ok(())
    }

    fn record_resource(&mut self, path: &Path) -> Result<()> {
        self.active_mut()?;
        let file = self.resources.find_or_store(path)?;
        let stored = self.relative_to_base(&file.path);
        let active = self.active_mut()?;
        active
            .record
            .resources
            .push(StoredRef(path.to_string_lossy().into_owned(), stored));
        active.flush()
    }

    fn record_artifact(&mut self, name: &str, source: &Path) -> Result<()> {
        if !is_plain_file_name(name) || RESERVED_NAMES.contains(&name) {
            return Err(RecorderError::InvalidArtifactName(name.to_string()));
        }
        let active = self.active_mut()?;
        let target = active.dir.join(name);
        if target.exists() || active.holds_result_payload(name) {
            return Err(RecorderError::ArtifactExists(name.to_string()));
        }
        fs::copy(source, &target).at_path(source)?;
        active.record.artifacts.push(name.to_string());
        active.flush()
    }
}

/// Linear extrapolation from a progress fraction in (0, 1]. Anything else
/// yields no estimate.
fn estimate_eta(progress: &Value, elapsed_secs: f64) -> Option<f64> {
    let p = progress.as_f64()?;
    if !(p > 0.0 && p <= 1.0) || elapsed_secs < 0.0 {
        return None;
    }
    let eta = (1.0 / p - 1.0) * elapsed_secs;
    eta.is_finite().then_some(eta)
}

fn is_empty_info(info: &Value) -> bool {
    match info {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn eta_extrapolates_linearly() {
        assert_eq!(estimate_eta(&json!(0.25), 100.0), Some(300.0));
        assert_eq!(estimate_eta(&json!(1), 100.0), Some(0.0));
    }

    #[test]
    fn eta_is_absent_for_unusable_progress() {
        assert_eq!(estimate_eta(&json!(0), 100.0), None);
        assert_eq!(estimate_eta(&json!(-0.5), 100.0), None);
        assert_eq!(estimate_eta(&json!(1.5), 100.0), None);
        assert_eq!(estimate_eta(&json!("half"), 100.0), None);
        assert_eq!(estimate_eta(&json!({"progress": 0.5}), 100.0), None);
        assert_eq!(estimate_eta(&Value::Null, 100.0), None);
        assert_eq!(estimate_eta(&json!(0.5), -1.0), None);
    }

    #[test]
    fn file_name_rules() {
        assert!(is_plain_file_name("loss"));
        assert!(is_plain_file_name("model.pt"));
        assert!(!is_plain_file_name(""));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name("a/b"));
        assert!(!is_plain_file_name("a\\b"));
    }

    #[test]
    fn info_emptiness() {
        assert!(is_empty_info(&Value::Null));
        assert!(is_empty_info(&json!({})));
        assert!(is_empty_info(&json!([])));
        assert!(!is_empty_info(&json!({"epoch": 1})));
        assert!(!is_empty_info(&json!(0)));
    }

    #[test]
    fn recorders_compare_by_base_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = RunRecorder::create(dir.path(), RecorderOptions::default()).expect("a");
        let b = RunRecorder::create(
            dir.path(),
            RecorderOptions {
                priority: 5,
                ..RecorderOptions::default()
            },
        )
        .expect("b");
        let other = tempfile::tempdir().expect("tempdir");
        let c = RunRecorder::create(other.path(), RecorderOptions::default()).expect("c");
        assert!(a == b);
        assert!(a != c);
        assert_eq!(b.priority(), 5);
    }
}

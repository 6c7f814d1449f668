//! The run record persisted as `run.json`.
//!
//! The typed record is converted to a plain JSON tree before it is written,
//! so readers never have to reconstruct anything beyond strings, numbers,
//! arrays and objects. Encoding is canonical: decoding a written record and
//! encoding it again yields the same bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{PathContext, Result, StoreError};
use crate::{atomic_write_bytes, canonical_json_bytes};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    /// Stopped before completion; carries the caller's label, such as
    /// `INTERRUPTED` or `TIMEOUT`.
    Interrupted(String),
}

impl RunStatus {
    pub const INTERRUPTED: &'static str = "INTERRUPTED";

    pub fn interrupted() -> Self {
        RunStatus::Interrupted(Self::INTERRUPTED.to_string())
    }

    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Interrupted(label) => label,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl From<String> for RunStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "RUNNING" => RunStatus::Running,
            "COMPLETED" => RunStatus::Completed,
            "FAILED" => RunStatus::Failed,
            _ => RunStatus::Interrupted(value),
        }
    }
}

impl From<RunStatus> for String {
    fn from(value: RunStatus) -> Self {
        match value {
            RunStatus::Interrupted(label) => label,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(original path, stored path)`, written as a two element array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRef(pub String, pub String);

impl StoredRef {
    pub fn original(&self) -> &str {
        &self.0
    }

    pub fn stored(&self) -> &str {
        &self.1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentEntry {
    pub name: String,
    pub base_dir: String,
    pub sources: Vec<StoredRef>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mainfile: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub experiment: ExperimentEntry,
    pub command: String,
    pub host: Value,
    pub config: Value,
    pub meta: Value,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub heartbeat: Option<DateTime<Utc>>,
    /// Live heartbeat value while running; `{key: payload file}` once
    /// completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
    #[serde(default)]
    pub resources: Vec<StoredRef>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_trace: Option<String>,
}

impl RunRecord {
    pub fn new(
        experiment: ExperimentEntry,
        command: String,
        host: Value,
        config: Value,
        meta: Value,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            experiment,
            command,
            host,
            config,
            meta,
            status: RunStatus::Running,
            start_time,
            stop_time: None,
            heartbeat: None,
            result: None,
            eta: None,
            resources: Vec::new(),
            artifacts: Vec::new(),
            fail_trace: None,
        }
    }

    /// Stores a heartbeat value. JSON `null` clears the slot, which keeps
    /// the encoding canonical.
    pub fn set_live_result(&mut self, value: Value) {
        self.result = match value {
            Value::Null => None,
            other => Some(other),
        };
    }

    /// Non-finite estimates cannot be represented in JSON and are dropped.
    pub fn set_eta(&mut self, eta: Option<f64>) {
        self.eta = eta.filter(|v| v.is_finite());
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(StoreError::Encode)
    }

    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        canonical_json_bytes(&self.to_value()?)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).at_path(path)?;
        Self::from_json(&bytes).at_path(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_bytes(path, &self.to_canonical_json()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    fn sample_record() -> RunRecord {
        let experiment = ExperimentEntry {
            name: "mnist".to_string(),
            base_dir: "/work/mnist".to_string(),
            sources: vec![StoredRef(
                "train.py".to_string(),
                "_sources/train_abc.py".to_string(),
            )],
            dependencies: vec!["numpy==1.26".to_string()],
            mainfile: Some("train.py".to_string()),
        };
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        RunRecord::new(
            experiment,
            "train".to_string(),
            json!({"hostname": "node7", "cpu": "x86_64"}),
            json!({"lr": 0.01, "layers": [64, 32], "seed": 7}),
            json!({"comment": "baseline"}),
            start,
        )
    }

    #[test]
    fn status_strings_round_trip() {
        for (status, text) in [
            (RunStatus::Running, "RUNNING"),
            (RunStatus::Completed, "COMPLETED"),
            (RunStatus::Failed, "FAILED"),
            (RunStatus::interrupted(), "INTERRUPTED"),
            (RunStatus::Interrupted("TIMEOUT".to_string()), "TIMEOUT"),
        ] {
            assert_eq!(serde_json::to_value(&status).unwrap(), json!(text));
            assert_eq!(RunStatus::from(text.to_string()), status);
        }
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Interrupted("TIMEOUT".into()).is_terminal());
    }

    #[test]
    fn fresh_record_layout() {
        let value = sample_record().to_value().unwrap();
        assert_eq!(value["status"], "RUNNING");
        assert_eq!(value["heartbeat"], Value::Null);
        assert!(value.get("stop_time").is_none());
        assert!(value.get("eta").is_none());
        assert!(value.get("result").is_none());
        assert_eq!(value["resources"], json!([]));
        assert_eq!(
            value["experiment"]["sources"],
            json!([["train.py", "_sources/train_abc.py"]])
        );
        assert_eq!(value["start_time"], "2024-03-01T12:00:00Z");
    }

    #[test]
    fn encode_decode_encode_is_byte_identical() {
        let mut record = sample_record();
        record.heartbeat = Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap());
        record.set_live_result(json!(0.25));
        record.set_eta(Some(900.0));
        record
            .resources
            .push(StoredRef("w.bin".into(), "_resources/w_abc.bin".into()));
        record.artifacts.push("model.pt".into());

        let first = record.to_canonical_json().unwrap();
        let decoded = RunRecord::from_json(&first).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.to_canonical_json().unwrap(), first);
    }

    #[test]
    fn null_live_result_and_nan_eta_are_dropped() {
        let mut record = sample_record();
        record.set_live_result(Value::Null);
        record.set_eta(Some(f64::NAN));
        assert!(record.result.is_none());
        assert!(record.eta.is_none());
    }

    #[test]
    fn save_and_load_through_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let mut record = sample_record();
        record.status = RunStatus::Failed;
        record.stop_time = Some(Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap());
        record.fail_trace = Some("Traceback:\n  boom".to_string());
        record.save(&path).unwrap();

        let loaded = RunRecord::load(&path).unwrap();
        assert_eq!(loaded, record);
        assert_eq!(fs::read(&path).unwrap(), loaded.to_canonical_json().unwrap());
    }

    proptest! {
        #[test]
        fn arbitrary_metadata_round_trips(
            command in "[a-z_]{1,10}",
            lr in -1.0e6f64..1.0e6,
            tag in ".{0,16}",
            eta in proptest::option::of(0.0f64..1.0e7),
            artifacts in proptest::collection::vec("[a-z]{1,8}\\.[a-z]{2,3}", 0..4),
        ) {
            let mut record = sample_record();
            record.command = command;
            record.config = json!({"lr": lr, "tag": tag});
            record.set_eta(eta);
            record.artifacts = artifacts;
            let first = record.to_canonical_json().unwrap();
            let again = RunRecord::from_json(&first).unwrap().to_canonical_json().unwrap();
            prop_assert_eq!(first, again);
        }
    }
}

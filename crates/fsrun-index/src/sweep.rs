//! The aggregation sweep.
//!
//! Walks a tree of run directories, turns every run record found into an
//! index document and writes the index with a single rename at the end. A
//! broken run directory is reported and skipped; it never aborts the sweep.

use fsrun_core::{RunRecord, RunStatus, StoreError};
use fsrun_core::{RECORD_FILENAME, RESOURCES_DIRNAME, SOURCES_DIRNAME};
use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::store::{IndexStore, JsonIndex};
use crate::{IndexError, Result};

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    pub overwrite: bool,
    pub skip_incomplete: bool,
    pub record_filename: String,
    /// Directory names that are never descended into.
    pub skip_dirs: Vec<String>,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            skip_incomplete: true,
            record_filename: RECORD_FILENAME.to_string(),
            skip_dirs: vec![SOURCES_DIRNAME.to_string(), RESOURCES_DIRNAME.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepFailure {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct AggregateReport {
    pub indexed: usize,
    pub skipped_incomplete: usize,
    pub failures: Vec<SweepFailure>,
}

/// Receives per-directory problems found during a sweep.
pub trait SweepLog {
    fn skipped(&self, path: &Path, error: &IndexError);
}

/// Reports through `tracing`; what reaches the console depends on the
/// installed subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSweepLog;

impl SweepLog for TracingSweepLog {
    fn skipped(&self, path: &Path, error: &IndexError) {
        warn!(path = %path.display(), error = %error, "skipping run directory");
    }
}

pub fn aggregate(
    source_root: &Path,
    destination: &Path,
    options: &AggregateOptions,
) -> Result<AggregateReport> {
    aggregate_with_log(source_root, destination, options, &TracingSweepLog)
}

pub fn aggregate_with_log(
    source_root: &Path,
    destination: &Path,
    options: &AggregateOptions,
    log: &dyn SweepLog,
) -> Result<AggregateReport> {
    if destination.exists() && !options.overwrite {
        return Err(IndexError::DestinationExists(destination.to_path_buf()));
    }
    let root = source_root
        .canonicalize()
        .map_err(|source| StoreError::Io {
            path: source_root.to_path_buf(),
            source,
        })?;

    let mut index = JsonIndex::new(&root);
    let mut report = AggregateReport::default();
    let walker = WalkDir::new(&root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e.file_type().is_dir()
                || !options
                    .skip_dirs
                    .iter()
                    .any(|d| e.file_name().to_str() == Some(d.as_str()))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                let err = IndexError::from(err);
                log.skipped(&path, &err);
                report.failures.push(SweepFailure {
                    path,
                    message: err.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let record_path = entry.path().join(&options.record_filename);
        if !record_path.is_file() {
            continue;
        }
        let rel = relative_dir(&root, entry.path());
        match index_document(&record_path, &rel, options.skip_incomplete) {
            Ok(Some(document)) => {
                index.insert(document);
                report.indexed += 1;
            }
            Ok(None) => report.skipped_incomplete += 1,
            Err(err) => {
                log.skipped(entry.path(), &err);
                report.failures.push(SweepFailure {
                    path: entry.path().to_path_buf(),
                    message: err.to_string(),
                });
            }
        }
    }

    index.save(destination)?;
    info!(
        destination = %destination.display(),
        indexed = report.indexed,
        skipped_incomplete = report.skipped_incomplete,
        failures = report.failures.len(),
        "aggregation finished"
    );
    Ok(report)
}

/// Builds the index document for one run, or `None` when the run is
/// skipped for not being complete.
fn index_document(record_path: &Path, rel: &str, skip_incomplete: bool) -> Result<Option<Value>> {
    let mut record = RunRecord::load(record_path)?;
    if record.status != RunStatus::Completed {
        if skip_incomplete {
            return Ok(None);
        }
    } else {
        record.result = Some(rebase_results(record.result.take(), rel)?);
    }
    let mut document = record.to_value()?;
    if let Value::Object(map) = &mut document {
        map.insert("run_dir".to_string(), Value::String(rel.to_string()));
    }
    Ok(Some(document))
}

/// Prefixes every stored result reference with the run's directory relative
/// to the aggregation root. A completed run whose results are not all
/// stored references is rejected.
fn rebase_results(result: Option<Value>, rel: &str) -> Result<Value> {
    let entries = match result {
        Some(Value::Object(map)) => map,
        _ => return Err(IndexError::MissingResults),
    };
    let mut rebased = Map::new();
    for (key, value) in entries {
        let file = match value {
            Value::String(file) => file,
            _ => return Err(IndexError::UnresolvedResult { key }),
        };
        let path = if rel.is_empty() {
            file
        } else {
            format!("{}/{}", rel, file)
        };
        rebased.insert(key, Value::String(path));
    }
    Ok(Value::Object(rebased))
}

fn relative_dir(root: &Path, dir: &Path) -> String {
    dir.strip_prefix(root)
        .unwrap_or(dir)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn results_are_prefixed_with_the_run_directory() {
        let rebased =
            rebase_results(Some(json!({"loss": "loss.json.gz"})), "grid/lr_0.1/3").expect("rebase");
        assert_eq!(rebased, json!({"loss": "grid/lr_0.1/3/loss.json.gz"}));

        let at_root = rebase_results(Some(json!({"loss": "loss.json.gz"})), "").expect("rebase");
        assert_eq!(at_root, json!({"loss": "loss.json.gz"}));
    }

    #[test]
    fn live_values_in_completed_results_are_rejected() {
        let err = rebase_results(Some(json!({"loss": "loss.json.gz", "progress": 0.5})), "r")
            .expect_err("live value must be rejected");
        assert!(matches!(err, IndexError::UnresolvedResult { ref key } if key == "progress"));
        assert!(matches!(
            rebase_results(None, "r"),
            Err(IndexError::MissingResults)
        ));
        assert!(matches!(
            rebase_results(Some(json!(0.5)), "r"),
            Err(IndexError::MissingResults)
        ));
    }

    #[test]
    fn relative_dir_uses_forward_slashes() {
        let root = Path::new("/data/runs");
        assert_eq!(relative_dir(root, Path::new("/data/runs/a/b")), "a/b");
        assert_eq!(relative_dir(root, Path::new("/data/runs")), "");
    }
}

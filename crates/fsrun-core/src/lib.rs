//! Shared building blocks for the fsrun workspace: the content addressed
//! file store, the run record model and its canonical JSON encoding, and
//! the compressed result payload format.

use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod cas;
pub mod error;
pub mod payload;
pub mod record;

pub use cas::{find_or_store, sha256_file, ContentStore, StoredFile};
pub use error::{PathContext, Result, StoreError};
pub use payload::{read_compressed_json, result_file_name, write_compressed_json};
pub use record::{ExperimentEntry, RunRecord, RunStatus, StoredRef};

pub const RECORD_FILENAME: &str = "run.json";
pub const COUT_FILENAME: &str = "cout.txt";
pub const INFO_FILENAME: &str = "info.json";
pub const SOURCES_DIRNAME: &str = "_sources";
pub const RESOURCES_DIRNAME: &str = "_resources";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).at_path(path)
}

/// Writes `bytes` to a hidden sibling of `path` and renames it into place,
/// so readers only ever observe the old or the new complete file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = tmp_sibling(path);
    {
        let mut file = fs::File::create(&tmp).at_path(&tmp)?;
        file.write_all(bytes).at_path(&tmp)?;
        file.sync_all().at_path(&tmp)?;
    }
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err).at_path(path);
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub(crate) fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    path.with_file_name(format!(".{}.tmp.{}.{}.{}", name, pid, ts, seq))
}

/// Key-sorted, two-space indented JSON with a trailing newline.
pub fn canonical_json_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut sorted = value.clone();
    sort_json_value(&mut sorted);
    let mut bytes = serde_json::to_vec_pretty(&sorted).map_err(StoreError::Encode)?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn write_canonical_json(path: &Path, value: &Value) -> Result<()> {
    let bytes = canonical_json_bytes(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn read_json_file(path: &Path) -> Result<Value> {
    let bytes = fs::read(path).at_path(path)?;
    serde_json::from_slice(&bytes).at_path(path)
}

fn sort_json_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, v) in entries.iter_mut() {
                sort_json_value(v);
            }
            map.extend(entries);
        }
        Value::Array(items) => {
            for item in items {
                sort_json_value(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": true, "m": [ {"y": 1, "x": 2} ]}});
        let text = String::from_utf8(canonical_json_bytes(&value).expect("encode")).expect("utf8");
        assert_eq!(
            text,
            "{\n  \"a\": {\n    \"m\": [\n      {\n        \"x\": 2,\n        \"y\": 1\n      }\n    ],\n    \"z\": true\n  },\n  \"b\": 1\n}\n"
        );
    }

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("nested").join("file.txt");
        atomic_write_bytes(&target, b"first").expect("first write");
        atomic_write_bytes(&target, b"second").expect("second write");
        assert_eq!(fs::read(&target).expect("read"), b"second");

        let leftovers: Vec<_> = fs::read_dir(target.parent().expect("parent"))
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {:?}", leftovers);
    }

    #[test]
    fn read_json_file_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.json");
        fs::write(&path, "{not json").expect("write");
        let err = read_json_file(&path).expect_err("must fail");
        assert!(matches!(err, StoreError::Json { .. }));
        assert!(err.to_string().contains("broken.json"), "{}", err);
    }
}

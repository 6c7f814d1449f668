//! The index document store: an insert/search collection persisted as one
//! canonical JSON file.

use chrono::{DateTime, Utc};
use fsrun_core::{read_json_file, write_canonical_json};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

use crate::{IndexError, Result};

pub const INDEX_SCHEMA_VERSION: &str = "run_index_v1";

#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    /// 1-based insertion order.
    pub doc_id: u64,
    pub body: Value,
}

impl IndexDocument {
    pub fn status(&self) -> Option<&str> {
        self.body.get("status")?.as_str()
    }

    /// Run directory relative to the aggregation root.
    pub fn run_dir(&self) -> Option<&str> {
        self.body.get("run_dir")?.as_str()
    }

    pub fn experiment_name(&self) -> Option<&str> {
        self.body.pointer("/experiment/name")?.as_str()
    }

    pub fn result_keys(&self) -> Vec<&str> {
        self.body
            .get("result")
            .and_then(Value::as_object)
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Stored payload path of `key`, relative to the aggregation root.
    pub fn result_ref(&self, key: &str) -> Option<&str> {
        self.body.get("result")?.get(key)?.as_str()
    }
}

pub trait IndexStore {
    fn insert(&mut self, document: Value) -> u64;

    fn search<F>(&self, predicate: F) -> Vec<&IndexDocument>
    where
        F: Fn(&IndexDocument) -> bool;
}

#[derive(Debug, Clone)]
pub struct JsonIndex {
    root: PathBuf,
    created_at: DateTime<Utc>,
    documents: Vec<IndexDocument>,
}

impl JsonIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            created_at: Utc::now(),
            documents: Vec::new(),
        }
    }

    /// Directory the stored result references are relative to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn documents(&self) -> &[IndexDocument] {
        &self.documents
    }

    pub fn get(&self, doc_id: u64) -> Option<&IndexDocument> {
        self.documents.iter().find(|d| d.doc_id == doc_id)
    }

    pub fn to_value(&self) -> Value {
        let documents: Map<String, Value> = self
            .documents
            .iter()
            .map(|d| (d.doc_id.to_string(), d.body.clone()))
            .collect();
        json!({
            "schema_version": INDEX_SCHEMA_VERSION,
            "root": self.root.to_string_lossy(),
            "created_at": self.created_at.to_rfc3339(),
            "documents": documents,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_canonical_json(path, &self.to_value())?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let value = read_json_file(path)?;
        Self::from_value(path, value)
    }

    fn from_value(path: &Path, mut value: Value) -> Result<Self> {
        let format_err = |message: &str| IndexError::Format {
            path: path.to_path_buf(),
            message: message.to_string(),
        };
        let version = value.get("schema_version").and_then(Value::as_str);
        if version != Some(INDEX_SCHEMA_VERSION) {
            return Err(format_err("unsupported schema_version"));
        }
        let root = value
            .get("root")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| format_err("missing root"))?;
        let created_at = value
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| format_err("missing or invalid created_at"))?;
        let raw_documents = match value.get_mut("documents").map(Value::take) {
            Some(Value::Object(map)) => map,
            _ => return Err(format_err("documents must be an object")),
        };

        let mut documents = Vec::with_capacity(raw_documents.len());
        for (key, body) in raw_documents {
            let doc_id = key
                .parse::<u64>()
                .map_err(|_| format_err("document ids must be integers"))?;
            documents.push(IndexDocument { doc_id, body });
        }
        documents.sort_by_key(|d| d.doc_id);
        Ok(Self {
            root,
            created_at,
            documents,
        })
    }
}

impl IndexStore for JsonIndex {
    fn insert(&mut self, document: Value) -> u64 {
        let doc_id = self.documents.last().map(|d| d.doc_id + 1).unwrap_or(1);
        self.documents.push(IndexDocument {
            doc_id,
            body: document,
        });
        doc_id
    }

    fn search<F>(&self, predicate: F) -> Vec<&IndexDocument>
    where
        F: Fn(&IndexDocument) -> bool,
    {
        self.documents.iter().filter(|d| predicate(d)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_insertion_order_and_survive_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = JsonIndex::new(dir.path());
        for i in 0..12 {
            let id = index.insert(json!({"status": "COMPLETED", "n": i}));
            assert_eq!(id, i + 1);
        }
        let path = dir.path().join("index.json");
        index.save(&path).expect("save");

        let loaded = JsonIndex::load(&path).expect("load");
        assert_eq!(loaded.len(), 12);
        let ids: Vec<u64> = loaded.documents().iter().map(|d| d.doc_id).collect();
        assert_eq!(ids, (1..=12u64).collect::<Vec<_>>());
        assert_eq!(loaded.get(10).expect("doc 10").body["n"], 9);
        assert_eq!(loaded.root(), dir.path());
    }

    #[test]
    fn search_filters_by_predicate() {
        let mut index = JsonIndex::new("/tmp/runs");
        index.insert(json!({"status": "COMPLETED"}));
        index.insert(json!({"status": "FAILED"}));
        index.insert(json!({"status": "COMPLETED"}));
        let hits = index.search(|d| d.status() == Some("COMPLETED"));
        assert_eq!(hits.iter().map(|d| d.doc_id).collect::<Vec<_>>(), vec![1u64, 3]);
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("index.json");
        std::fs::write(&path, r#"{"schema_version": "v0", "documents": {}}"#).expect("write");
        let err = JsonIndex::load(&path).expect_err("must reject");
        assert!(matches!(err, IndexError::Format { .. }));
    }

    #[test]
    fn document_accessors() {
        let doc = IndexDocument {
            doc_id: 1,
            body: json!({
                "status": "COMPLETED",
                "run_dir": "grid/3",
                "experiment": {"name": "mnist"},
                "result": {"loss": "grid/3/loss.json.gz"}
            }),
        };
        assert_eq!(doc.status(), Some("COMPLETED"));
        assert_eq!(doc.run_dir(), Some("grid/3"));
        assert_eq!(doc.experiment_name(), Some("mnist"));
        assert_eq!(doc.result_keys(), vec!["loss"]);
        assert_eq!(doc.result_ref("loss"), Some("grid/3/loss.json.gz"));
        assert_eq!(doc.result_ref("acc"), None);
    }
}

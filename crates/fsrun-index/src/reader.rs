//! Read side of an aggregated index.

use fsrun_core::read_compressed_json;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::store::{IndexDocument, IndexStore, JsonIndex};
use crate::Result;

#[derive(Debug, Clone)]
pub struct RunIndex {
    index: JsonIndex,
    root: PathBuf,
}

impl RunIndex {
    /// Opens an index file. Result references resolve against the root the
    /// sweep recorded unless [`RunIndex::with_root`] says otherwise.
    pub fn open(path: &Path) -> Result<Self> {
        let index = JsonIndex::load(path)?;
        let root = index.root().to_path_buf();
        Ok(Self { index, root })
    }

    /// Resolves result references against `root`, for trees that moved
    /// after they were aggregated.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn documents(&self) -> &[IndexDocument] {
        self.index.documents()
    }

    pub fn get(&self, doc_id: u64) -> Option<&IndexDocument> {
        self.index.get(doc_id)
    }

    pub fn query<F>(&self, predicate: F) -> Vec<&IndexDocument>
    where
        F: Fn(&IndexDocument) -> bool,
    {
        self.index.search(predicate)
    }

    /// Loads the stored payload of each requested result key. Keys the
    /// document does not have, or whose payload cannot be read, are left
    /// out of the returned map.
    pub fn load_result_values(
        &self,
        document: &IndexDocument,
        keys: &[&str],
    ) -> BTreeMap<String, Value> {
        let mut values = BTreeMap::new();
        for key in keys {
            let Some(reference) = document.result_ref(key) else {
                debug!(doc_id = document.doc_id, key, "no stored result for key");
                continue;
            };
            let path = self.root.join(reference);
            match read_compressed_json(&path) {
                Ok(value) => {
                    values.insert(key.to_string(), value);
                }
                Err(err) => {
                    debug!(doc_id = document.doc_id, key, error = %err, "result payload unreadable");
                }
            }
        }
        values
    }
}

/// Matches documents whose value at the JSON `pointer` equals `expected`.
pub fn field_equals(pointer: &str, expected: Value) -> impl Fn(&IndexDocument) -> bool {
    let pointer = pointer.to_string();
    move |doc| doc.body.pointer(&pointer) == Some(&expected)
}

pub fn with_status(status: &str) -> impl Fn(&IndexDocument) -> bool {
    let status = status.to_string();
    move |doc| doc.status() == Some(status.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(body: Value) -> IndexDocument {
        IndexDocument { doc_id: 1, body }
    }

    #[test]
    fn predicates_match_fields() {
        let d = doc(json!({"status": "FAILED", "config": {"lr": 0.1}}));
        assert!(with_status("FAILED")(&d));
        assert!(!with_status("COMPLETED")(&d));
        assert!(field_equals("/config/lr", json!(0.1))(&d));
        assert!(!field_equals("/config/lr", json!(0.2))(&d));
        assert!(!field_equals("/config/missing", Value::Null)(&d));
    }
}

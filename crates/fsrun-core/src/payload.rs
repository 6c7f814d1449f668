//! Compressed result payloads: one gzip-compressed JSON document per
//! completed result key.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use crate::atomic_write_bytes;
use crate::error::{PathContext, Result, StoreError};

pub const RESULT_EXTENSION: &str = "json.gz";

pub fn result_file_name(key: &str) -> String {
    format!("{}.{}", key, RESULT_EXTENSION)
}

pub fn write_compressed_json(path: &Path, value: &Value) -> Result<()> {
    let json = serde_json::to_vec(value).map_err(StoreError::Encode)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json).at_path(path)?;
    let bytes = encoder.finish().at_path(path)?;
    atomic_write_bytes(path, &bytes)
}

pub fn read_compressed_json(path: &Path) -> Result<Value> {
    let file = fs::File::open(path).at_path(path)?;
    let mut decoder = GzDecoder::new(file);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json).at_path(path)?;
    serde_json::from_slice(&json).at_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_is_gzip_and_decodes_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(result_file_name("curve"));
        let value = json!({"loss": [0.9, 0.5, 0.25], "epochs": 3});
        write_compressed_json(&path, &value).expect("write");

        let raw = fs::read(&path).expect("read raw");
        assert_eq!(&raw[..2], &[0x1f, 0x8b], "gzip magic");
        assert_eq!(read_compressed_json(&path).expect("read"), value);
        assert!(path.ends_with("curve.json.gz"));
    }

    #[test]
    fn plain_text_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("loss.json.gz");
        fs::write(&path, b"0.1").expect("write");
        assert!(read_compressed_json(&path).is_err());
    }
}

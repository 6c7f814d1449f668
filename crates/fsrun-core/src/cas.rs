//! Content addressed file store.
//!
//! Entries live flat in one directory and are named
//! `<stem>_<sha256><ext>`. An entry is written once through a temporary file
//! and a rename; afterwards it is only ever read. Two runs storing the same
//! bytes under the same stem therefore share one physical file, and two
//! writers racing on a missing entry both rename identical content onto it.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{PathContext, Result, StoreError};
use crate::{ensure_dir, tmp_sibling};

const DIGEST_CHUNK: usize = 64 * 1024;
const DIGEST_HEX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub digest: String,
    /// False when the entry already existed and nothing was copied.
    pub written: bool,
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).at_path(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_CHUNK];
    loop {
        let n = file.read(&mut buf).at_path(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn stored_name(source: &Path, digest: &str) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match source.extension() {
        Some(ext) => format!("{}_{}.{}", stem, digest, ext.to_string_lossy()),
        None => format!("{}_{}", stem, digest),
    }
}

/// Stores `source` under `store_dir` unless an entry with the same stem and
/// digest is already present. The entry is named after the digest of the
/// bytes actually copied, so a source modified mid-store still yields an
/// entry that matches its name.
pub fn find_or_store(source: &Path, store_dir: &Path) -> Result<StoredFile> {
    ensure_dir(store_dir)?;
    let digest = sha256_file(source)?;
    let path = store_dir.join(stored_name(source, &digest));
    if path.exists() {
        debug!(entry = %path.display(), "content store hit");
        return Ok(StoredFile {
            path,
            digest,
            written: false,
        });
    }

    let tmp = tmp_sibling(&path);
    let copied = match copy_hashing(source, &tmp) {
        Ok(copied) => copied,
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
    };
    let path = store_dir.join(stored_name(source, &copied));
    if copied != digest && path.exists() {
        let _ = fs::remove_file(&tmp);
        debug!(entry = %path.display(), "content store hit after source changed");
        return Ok(StoredFile {
            path,
            digest: copied,
            written: false,
        });
    }
    if let Err(err) = fs::rename(&tmp, &path) {
        let _ = fs::remove_file(&tmp);
        return Err(err).at_path(&path);
    }
    debug!(entry = %path.display(), "content store write");
    Ok(StoredFile {
        path,
        digest: copied,
        written: true,
    })
}

/// Copies `source` to `dest`, returning the digest of the bytes written.
fn copy_hashing(source: &Path, dest: &Path) -> Result<String> {
    let mut input = fs::File::open(source).at_path(source)?;
    let mut output = fs::File::create(dest).at_path(dest)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_CHUNK];
    loop {
        let n = input.read(&mut buf).at_path(source)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        output.write_all(&buf[..n]).at_path(dest)?;
    }
    output.sync_all().at_path(dest)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Recovers the digest encoded in an entry's file name.
pub fn digest_from_entry_name(entry: &Path) -> Option<&str> {
    let stem = entry.file_stem()?.to_str()?;
    let (_, digest) = stem.rsplit_once('_')?;
    let valid = digest.len() == DIGEST_HEX_LEN
        && digest
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    valid.then_some(digest)
}

/// Re-hashes one entry and checks it against the digest in its name.
pub fn verify_entry(entry: &Path) -> Result<String> {
    let expected = digest_from_entry_name(entry)
        .ok_or_else(|| StoreError::UnrecognizedEntry(entry.to_path_buf()))?;
    let actual = sha256_file(entry)?;
    if actual != expected {
        return Err(StoreError::DigestMismatch {
            path: entry.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(actual)
}

/// A store directory, such as a base directory's `_sources` or `_resources`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentStore {
    dir: PathBuf,
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub verified: usize,
    pub problems: Vec<StoreError>,
}

impl ContentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn find_or_store(&self, source: &Path) -> Result<StoredFile> {
        find_or_store(source, &self.dir)
    }

    /// Where `source` would be stored, without writing anything.
    pub fn stored_path_for(&self, source: &Path) -> Result<PathBuf> {
        let digest = sha256_file(source)?;
        Ok(self.dir.join(stored_name(source, &digest)))
    }

    /// Checks every entry in the store. Hidden temporary files are ignored.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        let mut entries: Vec<PathBuf> = fs::read_dir(&self.dir)
            .at_path(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                !p.file_name()
                    .map(|n| n.to_string_lossy().starts_with('.'))
                    .unwrap_or(true)
            })
            .collect();
        entries.sort();
        for entry in entries {
            match verify_entry(&entry) {
                Ok(_) => report.verified += 1,
                Err(err) => report.problems.push(err),
            }
        }
        Ok(report)
    }
}

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode json: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("digest mismatch for {}: name says {expected}, content hashes to {actual}", path.display())]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("not a content store entry: {}", .0.display())]
    UnrecognizedEntry(PathBuf),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Attaches the path an I/O or JSON operation was working on.
pub trait PathContext<T> {
    fn at_path(self, path: &Path) -> Result<T>;
}

impl<T> PathContext<T> for std::io::Result<T> {
    fn at_path(self, path: &Path) -> Result<T> {
        self.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl<T> PathContext<T> for serde_json::Result<T> {
    fn at_path(self, path: &Path) -> Result<T> {
        self.map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

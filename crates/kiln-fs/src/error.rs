//! Filesystem store error types.

use std::path::PathBuf;

use kiln_core::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store directory {0} is locked by another process")]
    Locked(PathBuf),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store is closed")]
    Closed,
}

impl FsError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<FsError> for StoreError {
    fn from(err: FsError) -> Self {
        StoreError::unavailable("fs", err)
    }
}

pub type FsResult<T> = std::result::Result<T, FsError>;

//! On-disk job records.

use std::fs::{File, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kiln_core::{Job, JobId};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{FsError, FsResult};

const EXTENSION: &str = "json";
const LOCK_FILE: &str = ".lock";

/// A job plus its position in the enqueue order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Record {
    #[serde(flatten)]
    pub job: Job,
    /// Monotonic insertion counter, breaks ties between equal `queued_at`.
    pub seq: u64,
    /// Last heartbeat of the current lease, so liveness survives a reopen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

pub(crate) fn record_path(dir: &Path, id: &JobId) -> PathBuf {
    dir.join(format!("{}.{}", id, EXTENSION))
}

pub(crate) fn lock_path(dir: &Path) -> PathBuf {
    dir.join(LOCK_FILE)
}

/// Take exclusive ownership of the store directory.
///
/// The ownership is an advisory lock on `.lock`, held for as long as the
/// returned file stays open. The kernel drops it when the process dies, so a
/// lock file left behind by a crash does not keep the store closed.
pub(crate) async fn acquire_lock(dir: &Path) -> FsResult<File> {
    let path = lock_path(dir);
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| FsError::io(&path, e))?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Err(FsError::Locked(path)),
            Err(TryLockError::Error(e)) => return Err(FsError::io(&path, e)),
        }

        // Informational only; the lock is what counts.
        file.set_len(0).map_err(|e| FsError::io(&path, e))?;
        file.write_all(std::process::id().to_string().as_bytes())
            .map_err(|e| FsError::io(&path, e))?;
        Ok(file)
    })
    .await
    .map_err(|e| FsError::io(dir, std::io::Error::other(e)))?
}

/// Read every record in `dir`.
///
/// Files that are not job records, or that fail to parse, are skipped with a
/// warning so one bad file cannot take the whole store down.
pub(crate) async fn load_dir(dir: &Path) -> FsResult<Vec<Record>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| FsError::io(dir, e))?;
    let mut records = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(|e| FsError::io(dir, e))? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            continue;
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable job record");
                continue;
            }
        };

        match serde_json::from_slice::<Record>(&bytes) {
            Ok(record) if path_matches(&path, &record.job.id) => records.push(record),
            Ok(record) => {
                warn!(
                    path = %path.display(),
                    job_id = %record.job.id,
                    "Skipping job record stored under the wrong name"
                );
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping corrupt job record");
            }
        }
    }

    records.sort_by_key(|r| r.seq);
    Ok(records)
}

fn path_matches(path: &Path, id: &JobId) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|stem| stem == id.to_string())
}

/// Atomically replace the record on disk.
pub(crate) async fn write(dir: &Path, record: &Record) -> FsResult<()> {
    let path = record_path(dir, &record.job.id);
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(record)?;

    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| FsError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|e| FsError::io(&path, e))?;
    Ok(())
}

/// Remove a record. A record that is already gone is not an error.
pub(crate) async fn remove(dir: &Path, id: &JobId) -> FsResult<()> {
    let path = record_path(dir, id);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FsError::io(&path, e)),
    }
}

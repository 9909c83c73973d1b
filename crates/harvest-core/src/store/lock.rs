use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use chrono::Utc;
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::StorePaths;
use crate::error::{HarvestError, Result};

const LOCK_FILE_NAME: &str = ".lock";

/// Diagnostic payload written into the lock file for the benefit of a
/// second invocation that finds the store busy.
#[derive(Debug, Serialize, Deserialize)]
struct LockEntry {
    hostname: String,
    pid: u32,
    time: String,
}

/// Exclusive run lock over the whole store.
///
/// Both the pull pass and the garbage collector hold it for their full
/// duration; overlapping invocations would interleave commits and sweeps
/// with undefined results. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(paths: &StorePaths) -> Result<Self> {
        let path = paths.root.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let mut raw = String::new();
                let _ = file.read_to_string(&mut raw);
                let holder = serde_json::from_str::<LockEntry>(&raw)
                    .map(|e| format!("{} pid {}", e.hostname, e.pid))
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(HarvestError::Locked { holder });
            }
            Err(e) => return Err(e.into()),
        }

        let entry = LockEntry {
            hostname: hostname(),
            pid: std::process::id(),
            time: Utc::now().to_rfc3339(),
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        let data = serde_json::to_vec(&entry)
            .map_err(|e| HarvestError::Config(format!("lock serialize: {e}")))?;
        file.write_all(&data)?;
        file.flush()?;
        debug!(path = %path.display(), "run lock acquired");
        Ok(Self { file, path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "run lock released");
    }
}

pub(crate) fn hostname() -> String {
    #[cfg(unix)]
    {
        nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".into())
    }

    #[cfg(windows)]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorePaths;

    #[test]
    fn acquire_then_reacquire_after_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = StorePaths::derive(tmp.path());

        let guard = RunLock::acquire(&paths).unwrap();
        drop(guard);
        let _again = RunLock::acquire(&paths).unwrap();
    }

    #[test]
    fn second_acquire_in_same_process_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = StorePaths::derive(tmp.path());

        let _guard = RunLock::acquire(&paths).unwrap();
        // flock is per file-description, so a fresh open contends
        match RunLock::acquire(&paths) {
            Err(HarvestError::Locked { holder }) => {
                assert!(holder.contains("pid"), "holder diagnostics: {holder}");
            }
            other => panic!("expected Locked, got {other:?}"),
        }
    }
}

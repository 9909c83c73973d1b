use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::debug;

use crate::error::{HarvestError, Result};
use crate::remote::run_with_timeout;

/// Boundary to the bulk file-transfer tool. Mirrors the given remote
/// absolute paths into `staging`, preserving relative structure.
pub trait BulkTransfer {
    fn fetch(&self, host: &str, remote_paths: &[String], staging: &Path) -> Result<()>;
}

/// `BulkTransfer` over rsync's `--files-from` mode, rooted at the remote `/`
/// so staged files land at `<staging>/<remote absolute path>`.
pub struct RsyncTransfer {
    remote_user: String,
    timeout: Duration,
}

impl RsyncTransfer {
    pub fn new(remote_user: impl Into<String>, timeout: Duration) -> Self {
        Self {
            remote_user: remote_user.into(),
            timeout,
        }
    }
}

impl BulkTransfer for RsyncTransfer {
    fn fetch(&self, host: &str, remote_paths: &[String], staging: &Path) -> Result<()> {
        std::fs::create_dir_all(staging)?;

        let mut files_from = tempfile::NamedTempFile::new()?;
        for path in remote_paths {
            writeln!(files_from, "{path}")?;
        }
        files_from.flush()?;

        // -a preserves mtimes, which the verification gate depends on.
        let mut cmd = Command::new("rsync");
        cmd.arg("-az")
            .arg("--delete")
            .arg(format!("--files-from={}", files_from.path().display()))
            .arg(format!("{}@{}:/", self.remote_user, host))
            .arg(staging);
        debug!(host, files = remote_paths.len(), "rsync started");

        let output = run_with_timeout(&mut cmd, self.timeout).map_err(|e| {
            HarvestError::Transfer {
                host: host.to_string(),
                detail: e.to_string(),
            }
        })?;
        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HarvestError::Transfer {
                host: host.to_string(),
                detail: format!("rsync exited with {code}: {}", stderr.trim()),
            });
        }
        Ok(())
    }
}

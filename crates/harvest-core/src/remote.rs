//! Remote scanning seam: deploying the scanner binary, launching it
//! detached, polling for completion and fetching its manifest.
//!
//! Uses the system `ssh`/`scp` binaries so the operator's existing SSH
//! config and agent apply.

use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::ScanConfig;
use crate::error::{HarvestError, Result};

/// Fixed tick of the cooperative scan-completion poll loop.
const SCAN_POLL_TICK: Duration = Duration::from_secs(1);

const SSH_CONNECT_TIMEOUT_SECS: u32 = 10;

/// Boundary to the remote scanning agent. The engine only ever needs these
/// four operations; everything else about the agent is its own business.
pub trait RemoteShell {
    /// Copy the scanner binary onto the host.
    fn deploy_scanner(&self, host: &str) -> Result<()>;

    /// Launch the scan detached (fire-and-forget); returns once the launch
    /// command itself has been accepted, not when the scan finishes.
    fn launch_scan(&self, host: &str) -> Result<()>;

    /// Probe whether the scanner process is still running on the host.
    fn scan_in_progress(&self, host: &str) -> Result<bool>;

    /// Retrieve the completed scan's manifest into `dest`.
    fn fetch_manifest(&self, host: &str, dest: &Path) -> Result<()>;
}

/// `RemoteShell` over system ssh/scp.
pub struct SshShell {
    scan: ScanConfig,
}

impl SshShell {
    pub fn new(scan: ScanConfig) -> Self {
        Self { scan }
    }

    fn dest(&self, host: &str) -> String {
        format!("{}@{}", self.scan.remote_user, host)
    }

    /// Basename of the scanner binary; doubles as its process name for the
    /// liveness probe and as its filename in the remote home directory.
    fn scanner_name(&self) -> String {
        Path::new(&self.scan.scanner_bin)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.scan.scanner_bin.clone())
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.scan.command_timeout_seconds)
    }

    fn ssh(&self, host: &str, remote_command: &str) -> Result<Output> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}"))
            .arg(self.dest(host))
            .arg(remote_command);
        run_with_timeout(&mut cmd, self.command_timeout())
    }
}

impl RemoteShell for SshShell {
    fn deploy_scanner(&self, host: &str) -> Result<()> {
        // Stale scanners from an interrupted run hold the binary open.
        let name = self.scanner_name();
        let _ = self.ssh(host, &format!("killall -9 {name}"));

        let mut cmd = Command::new("scp");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg(&self.scan.scanner_bin)
            .arg(format!("{}:~/{name}", self.dest(host)));
        let output =
            run_with_timeout(&mut cmd, self.command_timeout()).map_err(|e| {
                HarvestError::AgentDeploy {
                    host: host.to_string(),
                    detail: e.to_string(),
                }
            })?;
        if !output.status.success() {
            return Err(HarvestError::AgentDeploy {
                host: host.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(host, "scanner deployed");
        Ok(())
    }

    fn launch_scan(&self, host: &str) -> Result<()> {
        let name = self.scanner_name();
        let root = &self.scan.remote_root;
        let script = format!(
            "nohup sh -c \"killall {name}; chmod +x ~/{name}; ~/{name} {root} generate\" >/dev/null 2>&1 &"
        );
        let output = self.ssh(host, &script).map_err(|e| HarvestError::AgentLaunch {
            host: host.to_string(),
            detail: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(HarvestError::AgentLaunch {
                host: host.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(host, "scan launched");
        Ok(())
    }

    fn scan_in_progress(&self, host: &str) -> Result<bool> {
        let output = self.ssh(host, &format!("pgrep -x {}", self.scanner_name()))?;
        Ok(output.status.success())
    }

    fn fetch_manifest(&self, host: &str, dest: &Path) -> Result<()> {
        let remote = format!(
            "{}:{}/{}",
            self.dest(host),
            self.scan.remote_root,
            crate::manifest::MANIFEST_FILE_NAME
        );
        let mut cmd = Command::new("scp");
        cmd.arg("-o").arg("BatchMode=yes").arg(remote).arg(dest);
        let output =
            run_with_timeout(&mut cmd, self.command_timeout()).map_err(|e| {
                HarvestError::ManifestFetch {
                    host: host.to_string(),
                    detail: e.to_string(),
                }
            })?;
        if !output.status.success() {
            return Err(HarvestError::ManifestFetch {
                host: host.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Outcome of the fleet-wide wait: hosts whose scan exited, and hosts that
/// were still running when the deadline passed.
pub struct ScanWaitOutcome {
    pub finished: Vec<String>,
    pub timed_out: Vec<String>,
}

/// Wait for every host's scan to exit: one cooperative loop, one probe per
/// host per fixed one-second tick. A probe failure counts as "exited" —
/// the manifest fetch will surface the real problem for that host.
pub fn wait_for_scans(
    shell: &dyn RemoteShell,
    hosts: &[String],
    wait_timeout: Duration,
    mut progress: impl FnMut(usize, usize, u64),
) -> ScanWaitOutcome {
    let started = Instant::now();
    let mut pending: Vec<String> = hosts.to_vec();
    let mut finished: Vec<String> = Vec::new();

    while !pending.is_empty() {
        pending.retain(|host| match shell.scan_in_progress(host) {
            Ok(true) => true,
            Ok(false) => {
                finished.push(host.clone());
                false
            }
            Err(e) => {
                warn!(host = %host, error = %e, "scan liveness probe failed, treating as exited");
                finished.push(host.clone());
                false
            }
        });
        progress(finished.len(), hosts.len(), started.elapsed().as_secs());
        if pending.is_empty() {
            break;
        }
        if started.elapsed() >= wait_timeout {
            warn!(hosts = ?pending, "scan wait deadline passed");
            break;
        }
        std::thread::sleep(SCAN_POLL_TICK);
    }

    ScanWaitOutcome {
        finished,
        timed_out: pending,
    }
}

/// Run an already-configured command with piped output, killing it if it
/// does not complete within the timeout.
pub(crate) fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<Output> {
    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let deadline = Instant::now() + timeout;
    let poll_interval = Duration::from_millis(100);

    loop {
        match child.try_wait()? {
            Some(status) => {
                let stdout = child
                    .stdout
                    .take()
                    .map(|mut r| {
                        let mut buf = Vec::new();
                        std::io::Read::read_to_end(&mut r, &mut buf).ok();
                        buf
                    })
                    .unwrap_or_default();
                let stderr = child
                    .stderr
                    .take()
                    .map(|mut r| {
                        let mut buf = Vec::new();
                        std::io::Read::read_to_end(&mut r, &mut buf).ok();
                        buf
                    })
                    .unwrap_or_default();
                return Ok(Output {
                    status,
                    stdout,
                    stderr,
                });
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("command timed out after {} seconds", timeout.as_secs()),
                    )
                    .into());
                }
                std::thread::sleep(poll_interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_with_timeout_captures_output() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2");
        let output = run_with_timeout(&mut cmd, Duration::from_secs(5)).unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "out");
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "err");
    }

    #[test]
    fn run_with_timeout_kills_hung_command() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let started = Instant::now();
        let err = run_with_timeout(&mut cmd, Duration::from_millis(300)).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(err.to_string().contains("timed out"));
    }
}

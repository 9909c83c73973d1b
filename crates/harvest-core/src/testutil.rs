use std::collections::{HashMap, HashSet};
use std::fs::{self, File, FileTimes};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local};

use crate::config::HarvestConfig;
use crate::error::{HarvestError, Result};
use crate::remote::RemoteShell;
use crate::transfer::BulkTransfer;

pub fn make_test_config(root: &Path) -> HarvestConfig {
    HarvestConfig {
        root: root.to_string_lossy().into_owned(),
        scan: Default::default(),
        transfer: Default::default(),
        gc: Default::default(),
    }
}

/// A file's modified time in the manifest's `YYYYMMDDHHMMSS` text form.
pub fn mtime_text(path: &Path) -> String {
    let modified = fs::metadata(path).unwrap().modified().unwrap();
    let local: DateTime<Local> = modified.into();
    local.format("%Y%m%d%H%M%S").to_string()
}

/// Fake remote shell: manifests served from memory, failures injectable
/// per host. Scans are always already finished.
#[derive(Default)]
pub struct FakeShell {
    pub manifests: HashMap<String, Vec<u8>>,
    pub fail_deploy: HashSet<String>,
    pub fail_fetch: HashSet<String>,
}

impl RemoteShell for FakeShell {
    fn deploy_scanner(&self, host: &str) -> Result<()> {
        if self.fail_deploy.contains(host) {
            return Err(HarvestError::AgentDeploy {
                host: host.to_string(),
                detail: "injected".into(),
            });
        }
        Ok(())
    }

    fn launch_scan(&self, _host: &str) -> Result<()> {
        Ok(())
    }

    fn scan_in_progress(&self, _host: &str) -> Result<bool> {
        Ok(false)
    }

    fn fetch_manifest(&self, host: &str, dest: &Path) -> Result<()> {
        if self.fail_fetch.contains(host) {
            return Err(HarvestError::ManifestFetch {
                host: host.to_string(),
                detail: "injected".into(),
            });
        }
        let raw = self
            .manifests
            .get(host)
            .ok_or_else(|| HarvestError::ManifestFetch {
                host: host.to_string(),
                detail: "no manifest configured".into(),
            })?;
        fs::write(dest, raw)?;
        Ok(())
    }
}

/// Fake bulk transfer backed by a local fixture tree standing in for the
/// remote filesystem. Copies preserve mtimes so the verification gate sees
/// what rsync's `-a` would deliver. Requested paths absent from the
/// fixture are simply not staged, like a file deleted between scan and
/// transfer.
pub struct FakeTransfer {
    fixture_root: PathBuf,
    pub fail_hosts: HashSet<String>,
    pub calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeTransfer {
    pub fn new(fixture_root: &Path) -> Self {
        Self {
            fixture_root: fixture_root.to_path_buf(),
            fail_hosts: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl BulkTransfer for FakeTransfer {
    fn fetch(&self, host: &str, remote_paths: &[String], staging: &Path) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((host.to_string(), remote_paths.to_vec()));

        for remote in remote_paths {
            let rel = remote.trim_start_matches('/');
            let source = self.fixture_root.join(rel);
            if !source.is_file() {
                continue;
            }
            let dest = staging.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&source, &dest)?;
            let modified = fs::metadata(&source)?.modified()?;
            File::options()
                .write(true)
                .open(&dest)?
                .set_times(FileTimes::new().set_modified(modified))?;
        }

        if self.fail_hosts.contains(host) {
            return Err(HarvestError::Transfer {
                host: host.to_string(),
                detail: "injected".into(),
            });
        }
        Ok(())
    }
}

/// Write a fixture file where the fake transfer will look for it
/// (`<fixture_root>/<remote_root>/<rel>`) and return its manifest record,
/// digesting and timestamping the real bytes on disk.
pub fn fixture_file(fixture_root: &Path, remote_root: &str, rel: &str, data: &[u8]) -> String {
    let path = fixture_root
        .join(remote_root.trim_start_matches('/'))
        .join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, data).unwrap();
    let hash = crate::hash::ContentHash::compute(data);
    format!("md5 {hash} {} {} {rel}", mtime_text(&path), data.len())
}

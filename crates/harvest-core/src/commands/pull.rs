use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{info, warn};

use crate::config::HarvestConfig;
use crate::error::{HarvestError, Result};
use crate::hash::ContentHash;
use crate::manifest::{Manifest, MANIFEST_FILE_NAME};
use crate::monitor::TransferMonitor;
use crate::remote::{wait_for_scans, RemoteShell};
use crate::store::lock::RunLock;
use crate::store::{BlobStore, CommitOutcome};
use crate::transfer::BulkTransfer;

/// Progress reporting for a pull pass. The transfer monitor publishes from
/// its sampling thread, so the sink must be shareable across threads.
pub type ProgressSink = Arc<dyn Fn(PullProgressEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub enum PullProgressEvent {
    ScanLaunched {
        host: String,
    },
    ScanWait {
        finished: usize,
        total: usize,
        elapsed_secs: u64,
    },
    HostStarted {
        host: String,
        current: usize,
        total: usize,
    },
    TransferStarted {
        host: String,
        files: usize,
        expected_bytes: u64,
    },
    TransferPercent {
        host: String,
        percent: u8,
    },
    HostFinished {
        host: String,
    },
}

fn emit(sink: &Option<ProgressSink>, event: PullProgressEvent) {
    if let Some(sink) = sink {
        sink(event);
    }
}

/// One file selected for transfer: the representative path for a unique
/// content hash the store does not yet have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    pub hash: ContentHash,
    /// Absolute path on the remote host.
    pub remote_path: String,
    pub mtime: String,
    pub size: u64,
}

#[derive(Debug, Default)]
pub struct TransferPlan {
    pub items: Vec<TransferItem>,
    pub expected_bytes: u64,
}

/// Per-host reconciliation outcome. All failure counters are local to the
/// host; none of them aborts the run.
#[derive(Debug)]
pub struct HostReport {
    pub hostname: String,
    /// Entries in the fetched manifest.
    pub entries: usize,
    /// Unique hashes selected for transfer.
    pub planned: usize,
    pub expected_bytes: u64,
    pub committed: usize,
    pub already_present: usize,
    /// Needed files that never appeared in staging.
    pub missing: usize,
    /// Staged files whose live mtime/size disagreed with the manifest.
    pub mismatched: usize,
    /// Transfer-tool failure, surfaced but not fatal: whatever was staged
    /// has still been salvaged.
    pub transfer_error: Option<HarvestError>,
}

impl HostReport {
    pub fn skipped(&self) -> usize {
        self.missing + self.mismatched
    }

    pub fn clean(&self) -> bool {
        self.skipped() == 0 && self.transfer_error.is_none()
    }
}

/// Aggregate outcome of one pass over a host list.
#[derive(Debug)]
pub struct RunReport {
    pub reports: Vec<HostReport>,
    /// Hosts excluded from the pass, with the failure that excluded them.
    pub failed: Vec<(String, HarvestError)>,
    pub store_bytes: u64,
}

impl RunReport {
    pub fn all_clean(&self) -> bool {
        self.failed.is_empty() && self.reports.iter().all(HostReport::clean)
    }
}

/// Build the needed set for one host: walk manifest entries in order,
/// skipping hashes the store already has and duplicates within the
/// manifest itself, keeping one representative remote path per hash.
pub fn plan_transfer(manifest: &Manifest, store: &BlobStore, remote_root: &str) -> TransferPlan {
    let mut plan = TransferPlan::default();
    let mut selected = std::collections::HashSet::new();
    let root = remote_root.trim_end_matches('/');
    for entry in &manifest.entries {
        if store.exists(&entry.hash) || !selected.insert(entry.hash) {
            continue;
        }
        plan.expected_bytes += entry.size;
        plan.items.push(TransferItem {
            hash: entry.hash,
            remote_path: format!("{root}/{}", entry.path),
            mtime: entry.mtime.clone(),
            size: entry.size,
        });
    }
    plan
}

/// Live mtime of a staged file in the manifest's fixed-precision text form.
fn staged_mtime(path: &Path) -> Result<String> {
    let modified = std::fs::metadata(path)?.modified()?;
    let local: DateTime<Local> = modified.into();
    Ok(local.format("%Y%m%d%H%M%S").to_string())
}

/// Reconcile one host's manifest against the store: plan, transfer,
/// verify, commit, persist. Always persists the manifest at the end —
/// the caller only reaches this point once the manifest fetch succeeded.
pub fn reconcile_host(
    config: &HarvestConfig,
    store: &BlobStore,
    transfer: &dyn BulkTransfer,
    sink: &Option<ProgressSink>,
    hostname: &str,
    manifest: &Manifest,
) -> Result<HostReport> {
    let paths = store.paths().clone();
    let plan = plan_transfer(manifest, store, &config.scan.remote_root);
    let mut report = HostReport {
        hostname: hostname.to_string(),
        entries: manifest.entries.len(),
        planned: plan.items.len(),
        expected_bytes: plan.expected_bytes,
        committed: 0,
        already_present: 0,
        missing: 0,
        mismatched: 0,
        transfer_error: None,
    };

    // Empty delta: nothing to transfer, straight to persistence.
    if plan.items.is_empty() {
        info!(host = hostname, entries = report.entries, "store already has everything");
        manifest.persist(&paths, hostname)?;
        return Ok(report);
    }

    let staging = paths.host_temp_dir(hostname).join("staging");
    std::fs::create_dir_all(&staging)?;

    emit(
        sink,
        PullProgressEvent::TransferStarted {
            host: hostname.to_string(),
            files: plan.items.len(),
            expected_bytes: plan.expected_bytes,
        },
    );

    let monitor = sink.as_ref().map(|s| {
        let sink = Arc::clone(s);
        let host = hostname.to_string();
        TransferMonitor::start(
            &paths.root,
            plan.expected_bytes,
            Duration::from_secs(config.transfer.sample_interval_seconds),
            move |percent| {
                sink(PullProgressEvent::TransferPercent {
                    host: host.clone(),
                    percent,
                })
            },
        )
    });

    let remote_paths: Vec<String> = plan.items.iter().map(|i| i.remote_path.clone()).collect();
    let transfer_result = transfer.fetch(hostname, &remote_paths, &staging);
    if let Some(monitor) = monitor {
        monitor.stop();
    }
    match transfer_result {
        Ok(()) => emit(
            sink,
            PullProgressEvent::TransferPercent {
                host: hostname.to_string(),
                percent: 100,
            },
        ),
        Err(e) => {
            // Surfaced in the report; files that did land are still
            // verified and committed below.
            warn!(host = hostname, error = %e, "bulk transfer failed");
            report.transfer_error = Some(e);
        }
    }

    for item in &plan.items {
        let staged = staged_path(&staging, &item.remote_path);
        if !staged.is_file() {
            report.missing += 1;
            continue;
        }
        // The remote scanner hashed this file at scan time; if its
        // observable identity is unchanged we trust that digest instead
        // of re-hashing on the receiving side.
        let live_size = std::fs::metadata(&staged)?.len();
        if live_size != item.size || staged_mtime(&staged)? != item.mtime {
            warn!(
                host = hostname,
                path = %item.remote_path,
                "staged file changed between scan and transfer, skipping"
            );
            report.mismatched += 1;
            continue;
        }
        match store.commit(&item.hash, &staged)? {
            CommitOutcome::Stored => report.committed += 1,
            CommitOutcome::AlreadyPresent => report.already_present += 1,
        }
    }

    manifest.persist(&paths, hostname)?;
    info!(
        host = hostname,
        committed = report.committed,
        skipped = report.skipped(),
        "reconciliation finished"
    );
    Ok(report)
}

/// One full scan-and-reconcile pass over a fleet.
///
/// Scans are launched detached on every host first, then awaited in a
/// single poll loop, then hosts are reconciled sequentially. Per-host
/// failures exclude that host and never abort the others; only layout
/// creation and lock contention are fatal.
pub fn run(
    config: &HarvestConfig,
    shell: &dyn RemoteShell,
    transfer: &dyn BulkTransfer,
    hosts: &[String],
    sink: Option<ProgressSink>,
) -> Result<RunReport> {
    let paths = config.paths();
    let store = BlobStore::new(paths.clone());
    store.ensure_layout()?;
    let _lock = RunLock::acquire(&paths)?;

    let mut failed: Vec<(String, HarvestError)> = Vec::new();
    let mut launched: Vec<String> = Vec::new();

    for host in hosts {
        let outcome = shell
            .deploy_scanner(host)
            .and_then(|()| shell.launch_scan(host));
        match outcome {
            Ok(()) => {
                emit(&sink, PullProgressEvent::ScanLaunched { host: host.clone() });
                launched.push(host.clone());
            }
            Err(e) => {
                warn!(host = %host, error = %e, "host excluded from pass");
                failed.push((host.clone(), e));
            }
        }
    }

    let wait = wait_for_scans(
        shell,
        &launched,
        Duration::from_secs(config.scan.wait_timeout_seconds),
        |finished, total, elapsed_secs| {
            emit(
                &sink,
                PullProgressEvent::ScanWait {
                    finished,
                    total,
                    elapsed_secs,
                },
            )
        },
    );
    for host in &wait.timed_out {
        failed.push((
            host.clone(),
            HarvestError::ScanTimeout {
                host: host.clone(),
                seconds: config.scan.wait_timeout_seconds,
            },
        ));
    }

    // Preserve the caller's host order for the sequential phase.
    let ready: Vec<&String> = hosts
        .iter()
        .filter(|h| wait.finished.contains(*h))
        .collect();
    let total = ready.len();

    let mut reports = Vec::new();
    for (i, host) in ready.into_iter().enumerate() {
        emit(
            &sink,
            PullProgressEvent::HostStarted {
                host: host.clone(),
                current: i + 1,
                total,
            },
        );

        let host_temp = paths.host_temp_dir(host);
        std::fs::create_dir_all(&host_temp)?;
        let manifest_path = host_temp.join(MANIFEST_FILE_NAME);
        if let Err(e) = shell.fetch_manifest(host, &manifest_path) {
            warn!(host = %host, error = %e, "host excluded from pass");
            failed.push((host.clone(), e));
            continue;
        }

        let manifest = Manifest::load(&manifest_path)?;
        let report = reconcile_host(config, &store, transfer, &sink, host, &manifest)?;
        emit(&sink, PullProgressEvent::HostFinished { host: host.clone() });
        reports.push(report);
    }

    let store_bytes = store.total_size()?;
    Ok(RunReport {
        reports,
        failed,
        store_bytes,
    })
}

/// Where a planned item lands in the staging tree.
pub fn staged_path(staging: &Path, remote_path: &str) -> PathBuf {
    staging.join(remote_path.trim_start_matches('/'))
}

use std::collections::HashSet;
use std::time::SystemTime;

use tracing::{info, warn};

use crate::config::HarvestConfig;
use crate::error::Result;
use crate::hash::ContentHash;
use crate::manifest::{persisted_manifests, Manifest};
use crate::store::lock::RunLock;
use crate::store::BlobStore;

#[derive(Debug, Clone)]
pub enum GcProgressEvent {
    WorkspaceSwept,
    MarkFinished {
        manifests: usize,
        live: usize,
        stale_skipped: usize,
    },
    LivenessProgress {
        scanned: usize,
    },
    LivenessFinished {
        deleted: usize,
    },
    IntegrityProgress {
        checked: usize,
    },
    IntegrityFinished {
        deleted: usize,
    },
}

/// Summary of a collection run.
#[derive(Debug, Default)]
pub struct GcReport {
    pub manifests_read: usize,
    pub stale_manifests_skipped: usize,
    pub live_hashes: usize,
    pub orphans_deleted: usize,
    pub orphan_bytes_freed: u64,
    pub blobs_checked: usize,
    pub corrupt_deleted: usize,
    pub corrupt_bytes_freed: u64,
}

fn emit_progress(
    progress: &mut Option<&mut dyn FnMut(GcProgressEvent)>,
    event: GcProgressEvent,
) {
    if let Some(callback) = progress.as_deref_mut() {
        callback(event);
    }
}

/// Union of hashes referenced by every currently persisted manifest —
/// the sole authority on what the sweeps may keep. Recomputed fresh on
/// every run, never cached.
pub fn build_live_set(
    config: &HarvestConfig,
    now: SystemTime,
) -> Result<(HashSet<ContentHash>, usize, usize)> {
    let paths = config.paths();
    let expiry = config.gc.expiry()?;
    let mut live = HashSet::new();
    let mut read = 0usize;
    let mut stale_skipped = 0usize;

    for persisted in persisted_manifests(&paths)? {
        if let Some(max_age) = expiry {
            let age = now
                .duration_since(persisted.modified)
                .unwrap_or_default();
            if age > max_age {
                warn!(
                    host = %persisted.hostname,
                    age_days = age.as_secs() / 86400,
                    "manifest exceeds staleness threshold, excluded from mark phase"
                );
                stale_skipped += 1;
                continue;
            }
        }
        let manifest = Manifest::load(&persisted.path)?;
        for entry in &manifest.entries {
            live.insert(entry.hash);
        }
        read += 1;
    }
    Ok((live, read, stale_skipped))
}

/// Run the collector: workspace sweep, then liveness sweep, then the
/// expensive full-read integrity sweep, all under the run lock.
///
/// The liveness sweep goes first so unreferenced content is reclaimed on
/// filesystem metadata alone before any I/O is spent verifying it.
pub fn run(
    config: &HarvestConfig,
    mut progress: Option<&mut dyn FnMut(GcProgressEvent)>,
) -> Result<GcReport> {
    let paths = config.paths();
    let store = BlobStore::new(paths.clone());
    store.ensure_layout()?;
    let _lock = RunLock::acquire(&paths)?;

    let mut report = GcReport::default();

    // Staging workspaces are disposable between runs by definition.
    match std::fs::remove_dir_all(&paths.temp_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    std::fs::create_dir_all(&paths.temp_dir)?;
    emit_progress(&mut progress, GcProgressEvent::WorkspaceSwept);

    // Mark.
    let (live, manifests_read, stale_skipped) = build_live_set(config, SystemTime::now())?;
    report.manifests_read = manifests_read;
    report.stale_manifests_skipped = stale_skipped;
    report.live_hashes = live.len();
    emit_progress(
        &mut progress,
        GcProgressEvent::MarkFinished {
            manifests: manifests_read,
            live: live.len(),
            stale_skipped,
        },
    );

    // Sweep unreferenced blobs.
    let mut scanned = 0usize;
    store.for_each_blob(|hash, size| {
        scanned += 1;
        if !live.contains(hash) {
            store.delete(hash)?;
            report.orphans_deleted += 1;
            report.orphan_bytes_freed += size;
        }
        if scanned.is_multiple_of(1000) {
            emit_progress(&mut progress, GcProgressEvent::LivenessProgress { scanned });
        }
        Ok(())
    })?;
    emit_progress(
        &mut progress,
        GcProgressEvent::LivenessFinished {
            deleted: report.orphans_deleted,
        },
    );
    info!(
        deleted = report.orphans_deleted,
        live = report.live_hashes,
        "liveness sweep finished"
    );

    // Sweep corrupted blobs. Full content read per blob — the one
    // expensive operation in the system, hence the incremental progress.
    store.for_each_blob(|hash, size| {
        report.blobs_checked += 1;
        if !store.verify(hash)? {
            warn!(blob = %hash, "recomputed digest disagrees with key, deleting");
            store.delete(hash)?;
            report.corrupt_deleted += 1;
            report.corrupt_bytes_freed += size;
        }
        if report.blobs_checked.is_multiple_of(1000) {
            emit_progress(
                &mut progress,
                GcProgressEvent::IntegrityProgress {
                    checked: report.blobs_checked,
                },
            );
        }
        Ok(())
    })?;
    emit_progress(
        &mut progress,
        GcProgressEvent::IntegrityFinished {
            deleted: report.corrupt_deleted,
        },
    );
    info!(
        checked = report.blobs_checked,
        deleted = report.corrupt_deleted,
        "integrity sweep finished"
    );

    Ok(report)
}

use std::io::Write;
use std::sync::{Arc, Mutex};

use harvest_core::commands::gc::GcProgressEvent;
use harvest_core::commands::pull::{ProgressSink, PullProgressEvent};

use crate::format::format_bytes;

/// A single `\r`-refreshed status line on stderr. Redraws pad with spaces
/// so a shorter line fully covers the previous one.
#[derive(Default)]
pub(crate) struct StatusLine {
    last_len: usize,
    open: bool,
}

impl StatusLine {
    pub(crate) fn redraw(&mut self, line: &str) {
        let pad = self.last_len.saturating_sub(line.len());
        eprint!("\r{line}{}", " ".repeat(pad));
        let _ = std::io::stderr().flush();
        self.last_len = line.len();
        self.open = true;
    }

    pub(crate) fn println(&mut self, line: &str) {
        self.finish();
        eprintln!("{line}");
    }

    pub(crate) fn finish(&mut self) {
        if self.open {
            eprintln!();
            self.open = false;
            self.last_len = 0;
        }
    }
}

/// Renders pull progress. Events arrive both from the orchestrator thread
/// and from the transfer monitor's sampling thread, hence the mutex.
pub(crate) struct PullRenderer {
    line: StatusLine,
}

impl PullRenderer {
    pub(crate) fn new() -> Self {
        Self {
            line: StatusLine::default(),
        }
    }

    fn on_event(&mut self, event: PullProgressEvent) {
        match event {
            PullProgressEvent::ScanLaunched { host } => {
                self.line.println(&format!("Scan started on {host}"));
            }
            PullProgressEvent::ScanWait {
                finished,
                total,
                elapsed_secs,
            } => {
                self.line.redraw(&format!(
                    "Waiting for scans to finish ... {finished}/{total} ({elapsed_secs}s)"
                ));
            }
            PullProgressEvent::HostStarted {
                host,
                current,
                total,
            } => {
                self.line.finish();
                self.line.redraw(&format!("[{current}/{total}] {host}: fetching manifest"));
            }
            PullProgressEvent::TransferStarted {
                host,
                files,
                expected_bytes,
            } => {
                self.line.redraw(&format!(
                    "{host}: pulling {files} new files ({})   0%",
                    format_bytes(expected_bytes)
                ));
            }
            PullProgressEvent::TransferPercent { host, percent } => {
                self.line.redraw(&format!("{host}: pulling {percent:>3}%"));
            }
            PullProgressEvent::HostFinished { .. } => {
                self.line.finish();
            }
        }
    }

    pub(crate) fn finish(&mut self) {
        self.line.finish();
    }
}

pub(crate) fn pull_sink(renderer: Arc<Mutex<PullRenderer>>) -> ProgressSink {
    Arc::new(move |event| {
        renderer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_event(event);
    })
}

/// Renders garbage-collection progress on a single status line.
pub(crate) struct GcRenderer {
    line: StatusLine,
}

impl GcRenderer {
    pub(crate) fn new() -> Self {
        Self {
            line: StatusLine::default(),
        }
    }

    pub(crate) fn on_event(&mut self, event: GcProgressEvent) {
        match event {
            GcProgressEvent::WorkspaceSwept => {
                self.line.println("Staging workspace removed");
            }
            GcProgressEvent::MarkFinished {
                manifests,
                live,
                stale_skipped,
            } => {
                if stale_skipped > 0 {
                    self.line.println(&format!(
                        "Live set: {live} hashes from {manifests} manifests ({stale_skipped} stale skipped)"
                    ));
                } else {
                    self.line
                        .println(&format!("Live set: {live} hashes from {manifests} manifests"));
                }
            }
            GcProgressEvent::LivenessProgress { scanned } => {
                self.line.redraw(&format!("Sweeping unreferenced blobs ... {scanned}"));
            }
            GcProgressEvent::LivenessFinished { deleted } => {
                self.line.finish();
                self.line.println(&format!("Deleted {deleted} unreferenced blobs"));
            }
            GcProgressEvent::IntegrityProgress { checked } => {
                self.line.redraw(&format!("Verifying blob digests ... {checked}"));
            }
            GcProgressEvent::IntegrityFinished { deleted } => {
                self.line.finish();
                self.line.println(&format!("Deleted {deleted} corrupted blobs"));
            }
        }
    }
}

//! Concurrent transfer-progress estimation via a side channel.
//!
//! While a bulk transfer is in flight, a sampling thread watches the store
//! filesystem's used-space figure grow and maps that growth onto the
//! expected transfer size. Purely observational: it never blocks the
//! transfer and its estimate is discarded once the transfer finishes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

/// Estimates, in percent, how far along an in-flight transfer is.
/// Reports are clamped to [0, 99]; only the owning transfer's completion
/// justifies 100, and the caller reports that itself.
pub struct TransferMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TransferMonitor {
    /// Spawn the sampling thread. `on_percent` is called once per interval
    /// with the current estimate.
    pub fn start(
        store_root: &Path,
        expected_bytes: u64,
        interval: Duration,
        mut on_percent: impl FnMut(u8) + Send + 'static,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let root: PathBuf = store_root.to_path_buf();

        let handle = std::thread::spawn(move || {
            let used_at_start = used_space(&root);
            while !flag.load(Ordering::Relaxed) {
                sleep_interruptible(&flag, interval);
                if flag.load(Ordering::Relaxed) {
                    break;
                }
                let percent = if expected_bytes == 0 {
                    100
                } else {
                    let grown = used_space(&root).saturating_sub(used_at_start);
                    (grown.saturating_mul(100) / expected_bytes).min(99) as u8
                };
                on_percent(percent);
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the sampler and wait for it to exit, discarding its state.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        debug!("transfer monitor stopped");
    }
}

impl Drop for TransferMonitor {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

/// Used bytes on the filesystem holding `path`; 0 when statfs fails (the
/// estimate then just stays at 0%, which is harmless).
fn used_space(path: &Path) -> u64 {
    let total = fs4::total_space(path).unwrap_or(0);
    let free = fs4::free_space(path).unwrap_or(0);
    total.saturating_sub(free)
}

/// Sleep up to `interval`, waking early when the stop flag is raised so
/// `stop()` never waits a full sampling period.
fn sleep_interruptible(flag: &AtomicBool, interval: Duration) {
    const STEP: Duration = Duration::from_millis(100);
    let mut remaining = interval;
    while !flag.load(Ordering::Relaxed) && !remaining.is_zero() {
        let step = remaining.min(STEP);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn reports_hundred_for_zero_expected_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel();
        let monitor = TransferMonitor::start(
            tmp.path(),
            0,
            Duration::from_millis(50),
            move |p| {
                let _ = tx.send(p);
            },
        );
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, 100);
        monitor.stop();
    }

    #[test]
    fn estimate_is_clamped_below_hundred() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel();
        // Expected size of one byte: any filesystem churn overshoots,
        // so the clamp is what keeps the estimate at 99.
        let monitor = TransferMonitor::start(
            tmp.path(),
            1,
            Duration::from_millis(50),
            move |p| {
                let _ = tx.send(p);
            },
        );
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(first <= 99);
        monitor.stop();
    }

    #[test]
    fn stop_returns_promptly_despite_long_interval() {
        let tmp = tempfile::tempdir().unwrap();
        let monitor = TransferMonitor::start(tmp.path(), 1024, Duration::from_secs(60), |_| {});
        let started = std::time::Instant::now();
        monitor.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}

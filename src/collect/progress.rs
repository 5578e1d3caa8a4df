//! Background progress monitor for long collection runs.
//!
//! Periodically logs run statistics (pulls scanned, instances collected and
//! skipped, paused workers) so operators can track long runs without parsing
//! individual log lines. When every active worker is rate-limit paused, the
//! summary line says so.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

/// Snapshot of run counters at a point in time.
#[derive(Debug, Clone)]
pub struct CollectSnapshot {
    pub pulls_scanned: usize,
    pub filtered_out: usize,
    pub collected: usize,
    pub skipped: usize,
    pub pages_skipped: usize,
    pub paused_workers: usize,
    pub active_workers: usize,
    pub repos_done: usize,
    pub repos_failed: usize,
    /// Wall-clock elapsed time since the monitor started.
    pub elapsed: Duration,
}

/// Shared atomic counters incremented by repository workers.
///
/// Cloned into worker tasks; the background monitor reads them periodically.
#[derive(Debug, Clone, Default)]
pub struct CollectCounters {
    /// PRs pulled off the listing, whatever their fate.
    pub pulls_scanned: Arc<AtomicUsize>,
    /// PRs rejected by the candidate filter.
    pub filtered_out: Arc<AtomicUsize>,
    /// Task instances persisted.
    pub collected: Arc<AtomicUsize>,
    /// Qualifying PRs dropped during extraction.
    pub skipped: Arc<AtomicUsize>,
    /// Listing pages stepped past after exhausting retries.
    pub pages_skipped: Arc<AtomicUsize>,
    /// Workers currently waiting out a rate limit.
    pub paused_workers: Arc<AtomicUsize>,
    /// Workers currently running (from start to terminal state).
    pub active_workers: Arc<AtomicUsize>,
    pub repos_done: Arc<AtomicUsize>,
    pub repos_failed: Arc<AtomicUsize>,
}

impl CollectCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, start: Instant) -> CollectSnapshot {
        CollectSnapshot {
            pulls_scanned: self.pulls_scanned.load(Ordering::Relaxed),
            filtered_out: self.filtered_out.load(Ordering::Relaxed),
            collected: self.collected.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            pages_skipped: self.pages_skipped.load(Ordering::Relaxed),
            paused_workers: self.paused_workers.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            repos_done: self.repos_done.load(Ordering::Relaxed),
            repos_failed: self.repos_failed.load(Ordering::Relaxed),
            elapsed: start.elapsed(),
        }
    }
}

/// A background task that periodically logs collection progress.
///
/// Call [`ProgressMonitor::stop`] to cancel; dropping it also stops the task
/// at its next tick.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    pub fn start(counters: CollectCounters, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = counters.snapshot(start);
                let elapsed_secs = snap.elapsed.as_secs_f64();
                let scanned_per_sec = if elapsed_secs > 0.0 {
                    snap.pulls_scanned as f64 / elapsed_secs
                } else {
                    0.0
                };

                let all_paused = snap.active_workers > 0
                    && snap.paused_workers >= snap.active_workers;
                tracing::info!(
                    pulls_scanned = snap.pulls_scanned,
                    filtered_out = snap.filtered_out,
                    collected = snap.collected,
                    skipped = snap.skipped,
                    pages_skipped = snap.pages_skipped,
                    paused_workers = snap.paused_workers,
                    active_workers = snap.active_workers,
                    repos_done = snap.repos_done,
                    repos_failed = snap.repos_failed,
                    elapsed_secs = snap.elapsed.as_secs(),
                    scanned_per_sec = format!("{:.2}", scanned_per_sec),
                    "Collection progress"
                );
                if all_paused {
                    tracing::warn!(
                        paused_workers = snap.paused_workers,
                        "All workers are rate-limit paused; waiting for the earliest credential reset"
                    );
                }
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the background monitor to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_zeroed() {
        let counters = CollectCounters::new();
        let snap = counters.snapshot(Instant::now());
        assert_eq!(snap.pulls_scanned, 0);
        assert_eq!(snap.collected, 0);
        assert_eq!(snap.skipped, 0);
        assert_eq!(snap.paused_workers, 0);
        assert_eq!(snap.repos_done, 0);
    }

    #[test]
    fn clone_shares_state() {
        let counters = CollectCounters::new();
        let clone = counters.clone();

        counters.collected.fetch_add(2, Ordering::Relaxed);
        assert_eq!(clone.collected.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn monitor_start_stop() {
        let counters = CollectCounters::new();
        counters.pulls_scanned.fetch_add(7, Ordering::Relaxed);

        let monitor = ProgressMonitor::start(counters, Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(120)).await;
        monitor.stop().await;
    }
}

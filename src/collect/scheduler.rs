//! Fan-out of repository workers with bounded concurrency.
//!
//! Every queued repository gets its own worker task; a semaphore caps how
//! many run at once and the next one starts as soon as a slot frees up. All
//! workers share the credential pool, the counters, and the shutdown signal.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use super::extract::TaskExtractor;
use super::progress::{CollectCounters, ProgressMonitor};
use super::store::{PersistError, TaskStore};
use super::worker::{RepositoryWorker, WorkerReport, WorkerState};
use super::CollectTarget;
use crate::credentials::{CredentialPool, CredentialStatus};
use crate::forge::ForgeApi;

const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Final accounting for a whole run. Produced even when repositories failed.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub repos_done: usize,
    pub repos_failed: usize,
    pub pulls_scanned: u64,
    pub filtered_out: u64,
    pub collected: u64,
    pub skipped: u64,
    pub pages_skipped: u64,
    /// Credential state at the end of the run.
    pub rate_limit_state: Vec<CredentialStatus>,
}

pub struct CollectionScheduler {
    api: Arc<dyn ForgeApi>,
    pool: CredentialPool,
    extractor: Arc<TaskExtractor>,
    store: TaskStore,
    concurrency: usize,
    counters: CollectCounters,
    shutdown: watch::Receiver<bool>,
}

impl CollectionScheduler {
    pub fn new(
        api: Arc<dyn ForgeApi>,
        pool: CredentialPool,
        extractor: TaskExtractor,
        store: TaskStore,
        concurrency: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            api,
            pool,
            extractor: Arc::new(extractor),
            store,
            concurrency: concurrency.max(1),
            counters: CollectCounters::new(),
            shutdown,
        }
    }

    pub fn counters(&self) -> CollectCounters {
        self.counters.clone()
    }

    /// Run every target to a terminal state.
    ///
    /// Per-repository failures are counted in the summary; only storage
    /// failures abort the run.
    pub async fn run(&self, targets: Vec<CollectTarget>) -> Result<RunSummary, PersistError> {
        let monitor = ProgressMonitor::start(self.counters.clone(), MONITOR_INTERVAL);
        let limiter = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set = JoinSet::new();

        tracing::info!(
            repos = targets.len(),
            concurrency = self.concurrency,
            credentials = self.pool.len(),
            "Starting collection run"
        );

        for target in targets {
            let worker = RepositoryWorker::new(
                target,
                self.api.clone(),
                self.pool.clone(),
                self.extractor.clone(),
                self.store.clone(),
                self.counters.clone(),
                self.shutdown.clone(),
            );
            let limiter = limiter.clone();
            let counters = self.counters.clone();
            join_set.spawn(async move {
                // The semaphore is never closed while the set is draining.
                let _permit = limiter.acquire_owned().await.ok();
                counters.active_workers.fetch_add(1, Ordering::Relaxed);
                let result = worker.run().await;
                counters.active_workers.fetch_sub(1, Ordering::Relaxed);
                result
            });
        }

        let mut reports: Vec<WorkerReport> = Vec::new();
        let mut fatal: Option<PersistError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(report)) => {
                    match report.state {
                        WorkerState::Failed => {
                            self.counters.repos_failed.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {
                            self.counters.repos_done.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    reports.push(report);
                }
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "Persistence failure, aborting run");
                    fatal = Some(err);
                    break;
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "Worker task panicked");
                    self.counters.repos_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        join_set.shutdown().await;
        monitor.stop().await;

        if let Some(err) = fatal {
            return Err(err);
        }

        for report in reports.iter().filter(|r| r.state == WorkerState::Failed) {
            tracing::warn!(repo = %report.repo, "Repository failed");
        }

        let summary = RunSummary {
            repos_done: self.counters.repos_done.load(Ordering::Relaxed),
            repos_failed: self.counters.repos_failed.load(Ordering::Relaxed),
            pulls_scanned: self.counters.pulls_scanned.load(Ordering::Relaxed) as u64,
            filtered_out: self.counters.filtered_out.load(Ordering::Relaxed) as u64,
            collected: self.counters.collected.load(Ordering::Relaxed) as u64,
            skipped: self.counters.skipped.load(Ordering::Relaxed) as u64,
            pages_skipped: self.counters.pages_skipped.load(Ordering::Relaxed) as u64,
            rate_limit_state: self.pool.snapshot(),
        };
        tracing::info!(
            repos_done = summary.repos_done,
            repos_failed = summary.repos_failed,
            pulls_scanned = summary.pulls_scanned,
            collected = summary.collected,
            skipped = summary.skipped,
            "Collection run finished"
        );
        Ok(summary)
    }
}

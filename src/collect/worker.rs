//! One repository's collection loop: list, filter, extract, persist.
//!
//! The worker owns a credential lease for as long as it is making calls. On
//! exhaustion it hands the credential back as exhausted and pauses until the
//! pool can supply another one. A task record is always appended before the
//! progress high-water mark advances past it.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::extract::{SkipReason, TaskExtractor};
use super::filter::is_qualifying;
use super::progress::CollectCounters;
use super::store::{PersistError, ProgressRecord, TaskStore};
use super::CollectTarget;
use crate::credentials::{CredentialLease, CredentialPool};
use crate::forge::{ForgeApi, ForgeError, ForgeSession, PageCursor, PullRequestCandidate};

const MAX_TRANSIENT_ATTEMPTS: u32 = 3;
const TRANSIENT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Lifecycle of one repository worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Listing,
    Filtering,
    Extracting,
    Paused,
    Draining,
    Done,
    Failed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Starting => "starting",
            WorkerState::Listing => "listing",
            WorkerState::Filtering => "filtering",
            WorkerState::Extracting => "extracting",
            WorkerState::Paused => "paused",
            WorkerState::Draining => "draining",
            WorkerState::Done => "done",
            WorkerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Terminal accounting for one repository.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub repo: String,
    pub state: WorkerState,
    pub pulls_scanned: u64,
    pub filtered_out: u64,
    pub collected: u64,
    pub skipped: u64,
}

enum ItemOutcome {
    Collected,
    FilteredOut,
    Skipped(SkipReason),
    /// Transient failures exhausted their retries.
    GaveUp,
    /// Shutdown or an empty pool; stop scanning.
    Stop,
    /// Configuration-level failure for this repository.
    Fail,
}

pub struct RepositoryWorker {
    target: CollectTarget,
    api: Arc<dyn ForgeApi>,
    pool: CredentialPool,
    extractor: Arc<TaskExtractor>,
    store: TaskStore,
    counters: CollectCounters,
    shutdown: watch::Receiver<bool>,
    state: WorkerState,
}

impl RepositoryWorker {
    pub fn new(
        target: CollectTarget,
        api: Arc<dyn ForgeApi>,
        pool: CredentialPool,
        extractor: Arc<TaskExtractor>,
        store: TaskStore,
        counters: CollectCounters,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            target,
            api,
            pool,
            extractor,
            store,
            counters,
            shutdown,
            state: WorkerState::Starting,
        }
    }

    fn set_state(&mut self, next: WorkerState) {
        if self.state != next {
            tracing::debug!(repo = %self.target.repo, from = %self.state, to = %next, "Worker state");
            self.state = next;
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run the repository to a terminal state.
    ///
    /// Only persistence failures abort with `Err`; every forge-side problem
    /// resolves to a `Done` or `Failed` report.
    pub async fn run(mut self) -> Result<WorkerReport, PersistError> {
        let stem = self.target.file_stem();
        let mut progress = self.store.read_progress(&stem)?;
        // Crash between an append and the progress write leaves the id only
        // in the task file; fold it back in.
        progress.persisted.extend(self.store.persisted_ids(&stem)?);

        if progress.drained && !self.target.refresh {
            tracing::info!(repo = %self.target.repo, "Already drained, skipping");
            self.set_state(WorkerState::Done);
            return Ok(self.report(0, 0, 0, 0));
        }
        if self.target.refresh {
            progress.drained = false;
            progress.next_cursor = None;
        }

        let mut shutdown = self.shutdown.clone();
        let mut lease = self.pool.acquire_wait(&mut shutdown).await;
        if lease.is_none() {
            self.set_state(WorkerState::Done);
            return Ok(self.report(0, 0, 0, 0));
        }

        let mut cursor: Option<PageCursor> = progress.next_cursor.clone().map(PageCursor);
        let mut scanned = 0u64;
        let mut filtered = 0u64;
        let mut collected = 0u64;
        let mut skipped = 0u64;
        let mut reached_end = false;

        'pages: loop {
            if self.stopping() {
                break;
            }
            self.set_state(WorkerState::Listing);

            let mut attempt = 0u32;
            let page = loop {
                let Some(held) = lease.as_ref() else {
                    break 'pages;
                };
                let result = ForgeSession::new(self.api.as_ref(), held)
                    .list_pull_requests(&self.target.repo, cursor.as_ref())
                    .await;
                match result {
                    Ok(page) => break page,
                    Err(ForgeError::RateLimited { reset_at }) => {
                        lease = self.swap_exhausted(lease, reset_at).await;
                    }
                    Err(ForgeError::NotFound) | Err(ForgeError::Unauthorized) => {
                        tracing::error!(
                            repo = %self.target.repo,
                            "Repository missing or credentials rejected"
                        );
                        self.set_state(WorkerState::Failed);
                        return Ok(self.report(scanned, filtered, collected, skipped));
                    }
                    Err(err) if err.is_transient() && attempt < MAX_TRANSIENT_ATTEMPTS => {
                        attempt += 1;
                        lease = self.backoff_released(lease.take(), attempt).await;
                    }
                    Err(err) => {
                        tracing::warn!(
                            repo = %self.target.repo,
                            error = %err,
                            "Page permanently failing, stepping past it"
                        );
                        self.counters.pages_skipped.fetch_add(1, Ordering::Relaxed);
                        match cursor.as_ref().and_then(|c| self.api.advance_cursor(c)) {
                            Some(next) => {
                                progress.next_cursor = Some(next.0.clone());
                                self.store.write_progress(&stem, &progress)?;
                                cursor = Some(next);
                                attempt = 0;
                            }
                            None => break 'pages,
                        }
                    }
                }
            };

            let mut pulls = page.pulls;
            pulls.sort_by_key(|p| p.number);

            for candidate in pulls {
                if self.stopping() {
                    break 'pages;
                }
                if candidate.number <= progress.last_pull_scanned {
                    continue;
                }
                if let Some(max) = self.target.max_pulls {
                    if scanned >= max {
                        break 'pages;
                    }
                }
                scanned += 1;
                self.counters.pulls_scanned.fetch_add(1, Ordering::Relaxed);

                let outcome = self
                    .process_candidate(&mut lease, &mut progress, candidate)
                    .await?;
                match outcome {
                    ItemOutcome::Collected => collected += 1,
                    ItemOutcome::FilteredOut => filtered += 1,
                    ItemOutcome::Skipped(_) | ItemOutcome::GaveUp => skipped += 1,
                    ItemOutcome::Stop => break 'pages,
                    ItemOutcome::Fail => {
                        self.set_state(WorkerState::Failed);
                        return Ok(self.report(scanned, filtered, collected, skipped));
                    }
                }
                self.store.write_progress(&stem, &progress)?;
            }

            match page.next {
                Some(next) => {
                    // The next run can start listing here; re-listing the
                    // current page is only needed after a mid-page crash.
                    progress.next_cursor = Some(next.0.clone());
                    self.store.write_progress(&stem, &progress)?;
                    cursor = Some(next);
                }
                None => {
                    reached_end = true;
                    break;
                }
            }
        }

        self.set_state(WorkerState::Draining);
        if reached_end && !self.stopping() {
            progress.drained = true;
            progress.next_cursor = None;
        }
        self.store.write_progress(&stem, &progress)?;

        self.set_state(WorkerState::Done);
        tracing::info!(
            repo = %self.target.repo,
            pulls_scanned = scanned,
            filtered_out = filtered,
            collected,
            skipped,
            drained = progress.drained,
            "Repository finished"
        );
        Ok(self.report(scanned, filtered, collected, skipped))
    }

    /// Filter and, if qualifying, extract and persist one candidate.
    async fn process_candidate(
        &mut self,
        lease: &mut Option<CredentialLease>,
        progress: &mut ProgressRecord,
        mut candidate: PullRequestCandidate,
    ) -> Result<ItemOutcome, PersistError> {
        self.set_state(WorkerState::Filtering);
        candidate.linked_issues = self
            .extractor
            .policy()
            .resolved_issues(&candidate.title, &candidate.body);

        if !is_qualifying(&candidate, &self.target, self.extractor.policy()) {
            self.counters.filtered_out.fetch_add(1, Ordering::Relaxed);
            progress.last_pull_scanned = candidate.number;
            return Ok(ItemOutcome::FilteredOut);
        }

        self.set_state(WorkerState::Extracting);
        let stem = self.target.file_stem();
        let mut attempt = 0u32;
        loop {
            let Some(held) = lease.as_ref() else {
                return Ok(ItemOutcome::Stop);
            };
            let result = {
                let session = ForgeSession::new(self.api.as_ref(), held);
                self.extractor
                    .extract(&session, &self.target, &candidate)
                    .await
            };
            match result {
                Ok(Ok(task)) => {
                    if !progress.persisted.contains(&task.instance_id) {
                        self.store.append_task(&stem, &task)?;
                        progress.persisted.insert(task.instance_id.clone());
                        self.counters.collected.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(
                            repo = %self.target.repo,
                            instance = %task.instance_id,
                            "Collected task instance"
                        );
                    }
                    progress.last_pull_scanned = candidate.number;
                    return Ok(ItemOutcome::Collected);
                }
                Ok(Err(reason)) => {
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        repo = %self.target.repo,
                        pull = candidate.number,
                        reason = %reason,
                        "Skipped candidate"
                    );
                    progress.last_pull_scanned = candidate.number;
                    return Ok(ItemOutcome::Skipped(reason));
                }
                Err(ForgeError::RateLimited { reset_at }) => {
                    // Retry the same PR once a usable credential comes back.
                    *lease = self.swap_exhausted(lease.take(), reset_at).await;
                    self.set_state(WorkerState::Extracting);
                }
                Err(err) if err.is_transient() && attempt < MAX_TRANSIENT_ATTEMPTS => {
                    attempt += 1;
                    *lease = self.backoff_released(lease.take(), attempt).await;
                    self.set_state(WorkerState::Extracting);
                }
                Err(ForgeError::Unauthorized) => return Ok(ItemOutcome::Fail),
                Err(err) => {
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        repo = %self.target.repo,
                        pull = candidate.number,
                        error = %err,
                        "Giving up on candidate"
                    );
                    progress.last_pull_scanned = candidate.number;
                    return Ok(ItemOutcome::GaveUp);
                }
            }
        }
    }

    /// Mark the held credential exhausted and wait for a replacement.
    ///
    /// `None` means shutdown arrived (or the pool is empty) while waiting.
    async fn swap_exhausted(
        &mut self,
        lease: Option<CredentialLease>,
        reset_at: Option<DateTime<Utc>>,
    ) -> Option<CredentialLease> {
        if let Some(exhausted) = lease {
            tracing::info!(
                repo = %self.target.repo,
                credential = exhausted.id(),
                reset_at = ?reset_at,
                "Rate limited, pausing"
            );
            self.pool.mark_exhausted(exhausted, reset_at);
        }
        self.set_state(WorkerState::Paused);
        self.counters.paused_workers.fetch_add(1, Ordering::Relaxed);

        let mut shutdown = self.shutdown.clone();
        let next = self.pool.acquire_wait(&mut shutdown).await;
        self.counters.paused_workers.fetch_sub(1, Ordering::Relaxed);
        next
    }

    /// Sleep out a transient-failure backoff, then take a credential again.
    ///
    /// The held lease is dropped first; no suspension holds a credential
    /// slot. `None` means shutdown arrived while re-acquiring.
    async fn backoff_released(
        &mut self,
        lease: Option<CredentialLease>,
        attempt: u32,
    ) -> Option<CredentialLease> {
        drop(lease);
        let wait = TRANSIENT_BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1));
        tracing::debug!(
            repo = %self.target.repo,
            attempt,
            wait_ms = wait.as_millis() as u64,
            "Transient failure, backing off"
        );
        tokio::time::sleep(wait).await;
        let mut shutdown = self.shutdown.clone();
        self.pool.acquire_wait(&mut shutdown).await
    }

    fn report(
        &self,
        pulls_scanned: u64,
        filtered_out: u64,
        collected: u64,
        skipped: u64,
    ) -> WorkerReport {
        WorkerReport {
            repo: self.target.repo.clone(),
            state: self.state,
            pulls_scanned,
            filtered_out,
            collected,
            skipped,
        }
    }
}

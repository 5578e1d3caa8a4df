//! Shared pool of rate-limited API credentials.
//!
//! The pool is the only structure in the engine requiring mutual exclusion.
//! Exactly one worker holds a given credential at a time; acquisition,
//! release and exhaustion marking are serialized behind one mutex. Selection
//! is least-recently-acquired among eligible credentials so load spreads
//! evenly and each credential gets the longest possible runway before its
//! window resets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::sync::Notify;

use crate::forge::RateInfo;

/// One API credential and its observed rate-limit window.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub token: String,
    /// Requests left in the current window, once observed from a response.
    pub remaining: Option<u32>,
    /// When the window resets, once observed.
    pub reset_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
            remaining: None,
            reset_at: None,
        }
    }
}

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Backoff applied when a 403 arrives without rate-limit headers.
    pub opaque_backoff: Duration,
    /// Poll interval while blocked with no known reset time.
    pub blocked_poll: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            opaque_backoff: Duration::from_secs(300),
            blocked_poll: Duration::from_secs(5),
        }
    }
}

struct Slot {
    cred: Credential,
    in_use: bool,
    exhausted_until: Option<DateTime<Utc>>,
    /// Monotonic acquisition tick, for least-recently-used selection.
    last_acquired: u64,
}

impl Slot {
    /// A slot is eligible when free, past any exhaustion mark, and not known
    /// to be out of budget before its reset time.
    fn eligible(&self, now: DateTime<Utc>) -> bool {
        if self.in_use {
            return false;
        }
        if let Some(until) = self.exhausted_until {
            if now < until {
                return false;
            }
        }
        if self.cred.remaining == Some(0) {
            if let Some(reset) = self.cred.reset_at {
                if now < reset {
                    return false;
                }
            }
        }
        true
    }

    /// Earliest moment this slot could become eligible again, when known.
    fn recovers_at(&self) -> Option<DateTime<Utc>> {
        match (self.exhausted_until, self.cred.reset_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) if self.cred.remaining == Some(0) => Some(b),
            _ => None,
        }
    }
}

struct PoolState {
    slots: Vec<Slot>,
    tick: u64,
}

struct PoolInner {
    state: Mutex<PoolState>,
    config: PoolConfig,
    freed: Notify,
}

/// Result of an acquisition attempt.
pub enum Acquired {
    Lease(CredentialLease),
    /// Every credential is in use or exhausted. `resume_at` is the earliest
    /// known reset over the exhausted credentials, so the caller can sleep
    /// until then instead of polling tightly.
    Blocked { resume_at: Option<DateTime<Utc>> },
}

/// Point-in-time view of one credential, for summaries and logs.
#[derive(Debug, Clone)]
pub struct CredentialStatus {
    pub id: String,
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
    pub exhausted: bool,
}

/// Exclusive hold on one pool credential.
///
/// The slot is freed when the lease is released, marked exhausted, or
/// dropped. [`CredentialLease::record`] feeds post-call rate headers back
/// into the pool's bookkeeping while the lease is held.
pub struct CredentialLease {
    inner: Arc<PoolInner>,
    slot: usize,
    id: String,
    token: String,
    released: bool,
}

impl CredentialLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Apply post-call rate-limit headers to the held credential.
    pub fn record(&self, rate: &RateInfo) {
        if rate.is_empty() {
            return;
        }
        let mut state = self.inner.state.lock().expect("credential pool poisoned");
        let cred = &mut state.slots[self.slot].cred;
        if rate.remaining.is_some() {
            cred.remaining = rate.remaining;
        }
        if rate.reset_at.is_some() {
            cred.reset_at = rate.reset_at;
        }
    }

    fn free(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        {
            let mut state = self.inner.state.lock().expect("credential pool poisoned");
            state.slots[self.slot].in_use = false;
        }
        self.inner.freed.notify_waiters();
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        self.free();
    }
}

impl std::fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialLease")
            .field("id", &self.id)
            .finish()
    }
}

/// The shared credential pool.
#[derive(Clone)]
pub struct CredentialPool {
    inner: Arc<PoolInner>,
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>, config: PoolConfig) -> Self {
        let slots = credentials
            .into_iter()
            .map(|cred| Slot {
                cred,
                in_use: false,
                exhausted_until: None,
                last_acquired: 0,
            })
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState { slots, tick: 0 }),
                config,
                freed: Notify::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("credential pool poisoned")
            .slots
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Try to take a usable credential.
    ///
    /// Returns the least-recently-acquired eligible credential, or
    /// [`Acquired::Blocked`] with the earliest known recovery time.
    pub fn acquire(&self) -> Acquired {
        let now = Utc::now();
        let mut state = self.inner.state.lock().expect("credential pool poisoned");
        state.tick += 1;
        let tick = state.tick;

        let chosen = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.eligible(now))
            .min_by_key(|(_, s)| s.last_acquired)
            .map(|(i, _)| i);

        match chosen {
            Some(i) => {
                let slot = &mut state.slots[i];
                slot.in_use = true;
                slot.exhausted_until = None;
                slot.last_acquired = tick;
                Acquired::Lease(CredentialLease {
                    inner: Arc::clone(&self.inner),
                    slot: i,
                    id: slot.cred.id.clone(),
                    token: slot.cred.token.clone(),
                    released: false,
                })
            }
            None => {
                let resume_at = state
                    .slots
                    .iter()
                    .filter(|s| !s.in_use)
                    .filter_map(Slot::recovers_at)
                    .min();
                Acquired::Blocked { resume_at }
            }
        }
    }

    /// Return a credential to the pool after use.
    pub fn release(&self, lease: CredentialLease) {
        drop(lease);
    }

    /// Mark a credential exhausted until `reset_at` and free its slot.
    ///
    /// Called when a request on this credential came back rate-limited.
    /// Without a reset time from the response headers the pool falls back to
    /// the configured fixed backoff.
    pub fn mark_exhausted(&self, mut lease: CredentialLease, reset_at: Option<DateTime<Utc>>) {
        let until = reset_at.unwrap_or_else(|| {
            Utc::now()
                + chrono::Duration::from_std(self.inner.config.opaque_backoff)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300))
        });
        {
            let mut state = self.inner.state.lock().expect("credential pool poisoned");
            let slot = &mut state.slots[lease.slot];
            slot.exhausted_until = Some(until);
            slot.cred.remaining = Some(0);
            if reset_at.is_some() {
                slot.cred.reset_at = reset_at;
            }
        }
        tracing::info!(
            credential = %lease.id,
            reset_at = %until,
            "Credential marked exhausted"
        );
        lease.free();
    }

    /// Acquire, waiting while the pool is blocked.
    ///
    /// Sleeps until the earliest known reset (or the configured poll
    /// interval when no reset time is known), waking early when a lease is
    /// freed or shutdown is signalled. Returns `None` on shutdown.
    pub async fn acquire_wait(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<CredentialLease> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            match self.acquire() {
                Acquired::Lease(lease) => return Some(lease),
                Acquired::Blocked { resume_at } => {
                    let wait = resume_at
                        .and_then(|at| (at - Utc::now()).to_std().ok())
                        .unwrap_or(self.inner.config.blocked_poll)
                        .max(Duration::from_millis(50));
                    tracing::debug!(
                        wait_secs = wait.as_secs(),
                        resume_at = ?resume_at,
                        "All credentials busy or exhausted, waiting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.inner.freed.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// Snapshot of every credential's rate state.
    pub fn snapshot(&self) -> Vec<CredentialStatus> {
        let now = Utc::now();
        let state = self.inner.state.lock().expect("credential pool poisoned");
        state
            .slots
            .iter()
            .map(|s| CredentialStatus {
                id: s.cred.id.clone(),
                remaining: s.cred.remaining,
                reset_at: s.cred.reset_at,
                exhausted: !s.eligible(now) && !s.in_use,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn pool_of(n: usize) -> CredentialPool {
        let creds = (0..n)
            .map(|i| Credential::new(format!("cred-{i}"), format!("token-{i}")))
            .collect();
        CredentialPool::new(creds, PoolConfig::default())
    }

    fn expect_lease(acquired: Acquired) -> CredentialLease {
        match acquired {
            Acquired::Lease(lease) => lease,
            Acquired::Blocked { .. } => panic!("expected a lease"),
        }
    }

    #[test]
    fn acquire_hands_out_distinct_credentials() {
        let pool = pool_of(2);
        let a = expect_lease(pool.acquire());
        let b = expect_lease(pool.acquire());
        assert_ne!(a.id(), b.id());
        assert!(matches!(pool.acquire(), Acquired::Blocked { .. }));
    }

    #[test]
    fn release_makes_credential_eligible_again() {
        let pool = pool_of(1);
        let lease = expect_lease(pool.acquire());
        pool.release(lease);
        expect_lease(pool.acquire());
    }

    #[test]
    fn drop_frees_the_slot() {
        let pool = pool_of(1);
        {
            let _lease = expect_lease(pool.acquire());
        }
        expect_lease(pool.acquire());
    }

    #[test]
    fn least_recently_acquired_selection() {
        let pool = pool_of(3);
        // Use cred-0 and cred-1 once, then free everything.
        let a = expect_lease(pool.acquire());
        let first = a.id().to_string();
        pool.release(a);
        let b = expect_lease(pool.acquire());
        assert_ne!(b.id(), first);
        let second = b.id().to_string();
        pool.release(b);
        // The untouched credential must come out next.
        let c = expect_lease(pool.acquire());
        assert_ne!(c.id(), first);
        assert_ne!(c.id(), second);
    }

    #[test]
    fn exhausted_credential_not_handed_out_before_reset() {
        let pool = pool_of(1);
        let lease = expect_lease(pool.acquire());
        let reset = Utc::now() + ChronoDuration::seconds(60);
        pool.mark_exhausted(lease, Some(reset));

        match pool.acquire() {
            Acquired::Blocked { resume_at } => assert_eq!(resume_at, Some(reset)),
            Acquired::Lease(_) => panic!("exhausted credential must not be handed out"),
        }
    }

    #[test]
    fn exhausted_credential_usable_after_reset_elapses() {
        let pool = pool_of(1);
        let lease = expect_lease(pool.acquire());
        pool.mark_exhausted(lease, Some(Utc::now() - ChronoDuration::seconds(1)));
        expect_lease(pool.acquire());
    }

    #[test]
    fn rotation_prefers_available_credential_over_waiting() {
        // A exhausted with a 60s reset, B free: acquire must return B.
        let pool = pool_of(2);
        let a = expect_lease(pool.acquire());
        let a_id = a.id().to_string();
        pool.mark_exhausted(a, Some(Utc::now() + ChronoDuration::seconds(60)));

        let b = expect_lease(pool.acquire());
        assert_ne!(b.id(), a_id);
    }

    #[test]
    fn blocked_reports_earliest_reset_across_credentials() {
        let pool = pool_of(2);
        let early = Utc::now() + ChronoDuration::seconds(30);
        let late = Utc::now() + ChronoDuration::seconds(90);

        let a = expect_lease(pool.acquire());
        let b = expect_lease(pool.acquire());
        pool.mark_exhausted(a, Some(late));
        pool.mark_exhausted(b, Some(early));

        match pool.acquire() {
            Acquired::Blocked { resume_at } => assert_eq!(resume_at, Some(early)),
            Acquired::Lease(_) => panic!("both credentials are exhausted"),
        }
    }

    #[test]
    fn record_updates_remaining_and_zero_remaining_blocks() {
        let pool = pool_of(1);
        let lease = expect_lease(pool.acquire());
        lease.record(&RateInfo {
            remaining: Some(0),
            reset_at: Some(Utc::now() + ChronoDuration::seconds(60)),
        });
        pool.release(lease);

        // remaining == 0 with a future reset keeps the slot ineligible.
        assert!(matches!(pool.acquire(), Acquired::Blocked { .. }));
    }

    #[test]
    fn opaque_exhaustion_uses_fixed_backoff() {
        let pool = CredentialPool::new(
            vec![Credential::new("a", "t")],
            PoolConfig {
                opaque_backoff: Duration::from_secs(600),
                ..Default::default()
            },
        );
        let lease = expect_lease(pool.acquire());
        pool.mark_exhausted(lease, None);

        match pool.acquire() {
            Acquired::Blocked { resume_at } => {
                let at = resume_at.expect("backoff should produce a resume time");
                let secs = (at - Utc::now()).num_seconds();
                assert!(secs > 590 && secs <= 600, "unexpected backoff: {secs}s");
            }
            Acquired::Lease(_) => panic!("opaque 403 must exhaust the credential"),
        }
    }

    #[tokio::test]
    async fn acquire_wait_returns_none_on_shutdown() {
        let pool = pool_of(1);
        let _held = expect_lease(pool.acquire());
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(pool.acquire_wait(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn acquire_wait_wakes_when_lease_freed() {
        let pool = pool_of(1);
        let held = expect_lease(pool.acquire());
        let (_tx, mut rx) = watch::channel(false);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire_wait(&mut rx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(held);

        let lease = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should wake promptly")
            .unwrap();
        assert!(lease.is_some());
    }
}

//! Forge API boundary: wire types, error taxonomy and the client trait.
//!
//! The remote forge (pull requests, issues, commits, CI statuses) is consumed
//! through the [`ForgeApi`] trait so the collection engine can run against the
//! real HTTP client or an in-memory fake in tests. Every call surfaces the
//! credential's post-call rate-limit state alongside the payload, so callers
//! can update the credential pool without a separate round trip.

mod client;

pub use client::HttpForgeClient;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::CredentialLease;

/// Rate-limit state parsed from the `x-ratelimit-remaining` /
/// `x-ratelimit-reset` headers of a forge response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateInfo {
    /// Requests left in the credential's current window, when reported.
    pub remaining: Option<u32>,
    /// When the window resets, when reported.
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateInfo {
    /// Parse rate-limit headers from a response header map.
    pub fn from_headers(headers: &reqwest::header::HeaderMap) -> Self {
        let remaining = headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok());
        let reset_at = headers
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single());
        Self {
            remaining,
            reset_at,
        }
    }

    /// True when neither header was present on the response.
    pub fn is_empty(&self) -> bool {
        self.remaining.is_none() && self.reset_at.is_none()
    }
}

/// A forge payload together with the credential's post-call rate state.
#[derive(Debug, Clone)]
pub struct ForgeResponse<T> {
    pub value: T,
    pub rate: RateInfo,
}

impl<T> ForgeResponse<T> {
    pub fn new(value: T, rate: RateInfo) -> Self {
        Self { value, rate }
    }
}

/// Errors surfaced by forge calls.
///
/// The taxonomy drives worker behavior: `RateLimited` rotates credentials,
/// `Transient` retries in place with backoff, `NotFound`/`Malformed` skip the
/// item, `Unauthorized` fails the repository.
#[derive(Debug, Error)]
pub enum ForgeError {
    /// HTTP 403/429. `reset_at` comes from the rate-limit headers when the
    /// forge sent them; `None` means the caller should apply a fixed backoff.
    #[error("rate limit exceeded (reset at {reset_at:?})")]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    /// HTTP 404. Permanent for this item.
    #[error("resource not found")]
    NotFound,

    /// HTTP 401. The credential is not valid for this repository.
    #[error("unauthorized")]
    Unauthorized,

    /// 5xx, timeout or connection failure. Retryable with backoff.
    #[error("transient forge error: {0}")]
    Transient(String),

    /// Unexpected payload shape. Permanent for this item.
    #[error("malformed forge payload: {0}")]
    Malformed(String),
}

impl ForgeError {
    /// True for errors worth retrying in place (without a credential swap).
    pub fn is_transient(&self) -> bool {
        matches!(self, ForgeError::Transient(_))
    }
}

/// One pull request as returned by paginated listing.
///
/// Candidates are consumed by the filter and discarded unless they qualify;
/// only qualifying PRs proceed to full extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestCandidate {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub created_at: DateTime<Utc>,
    /// `Some` iff the PR was merged (a merely closed PR has `None`).
    pub merged_at: Option<DateTime<Utc>>,
    pub base_sha: String,
    /// Merge commit, when the forge reports one.
    pub merge_sha: Option<String>,
    /// Paths touched by the PR, when the listing payload carries them.
    /// Empty means unknown; the filter defers the file check to extraction.
    #[serde(default)]
    pub changed_files: Vec<String>,
    /// Issue numbers resolved by this PR. Filled in by the worker from the
    /// filter policy's keyword scan over title and body.
    #[serde(default)]
    pub linked_issues: Vec<u64>,
}

/// Opaque pagination continuation token.
///
/// The HTTP client stores the next-page URL here; fakes can use anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor(pub String);

/// One page of PR listing results plus the continuation token, if any.
#[derive(Debug, Clone)]
pub struct PullPage {
    pub pulls: Vec<PullRequestCandidate>,
    pub next: Option<PageCursor>,
}

/// An issue referenced by a pull request.
#[derive(Debug, Clone)]
pub struct IssueRecord {
    pub number: u64,
    pub title: String,
    pub body: String,
}

/// A comment on an issue, used for hint extraction.
#[derive(Debug, Clone)]
pub struct IssueComment {
    pub body: String,
    pub updated_at: DateTime<Utc>,
}

/// A commit belonging to a pull request.
#[derive(Debug, Clone)]
pub struct CommitRef {
    pub sha: String,
    pub authored_at: DateTime<Utc>,
}

/// Outcome of a single test identifier at a given commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub id: String,
    pub passed: bool,
}

/// CI test results for one commit.
#[derive(Debug, Clone, Default)]
pub struct TestReport {
    pub outcomes: Vec<TestOutcome>,
}

impl TestReport {
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// A repository discovered by language search.
#[derive(Debug, Clone)]
pub struct DiscoveredRepository {
    pub full_name: String,
    pub stars: u32,
}

/// The forge client contract.
///
/// Every method returns the payload together with the credential's post-call
/// rate state. Implementations must map HTTP failures onto [`ForgeError`] and
/// never panic on unexpected payloads.
#[async_trait]
pub trait ForgeApi: Send + Sync {
    /// One page of closed PRs in forward (increasing PR number) order.
    /// `cursor == None` starts from the resume point; the returned cursor
    /// continues pagination until exhausted.
    async fn list_pull_requests(
        &self,
        repo: &str,
        cursor: Option<&PageCursor>,
        lease: &CredentialLease,
    ) -> Result<ForgeResponse<PullPage>, ForgeError>;

    /// The full unified diff of a PR's merge.
    async fn fetch_diff(
        &self,
        repo: &str,
        number: u64,
        lease: &CredentialLease,
    ) -> Result<ForgeResponse<String>, ForgeError>;

    async fn fetch_issue(
        &self,
        repo: &str,
        number: u64,
        lease: &CredentialLease,
    ) -> Result<ForgeResponse<IssueRecord>, ForgeError>;

    async fn fetch_issue_comments(
        &self,
        repo: &str,
        number: u64,
        lease: &CredentialLease,
    ) -> Result<ForgeResponse<Vec<IssueComment>>, ForgeError>;

    async fn fetch_pull_commits(
        &self,
        repo: &str,
        number: u64,
        lease: &CredentialLease,
    ) -> Result<ForgeResponse<Vec<CommitRef>>, ForgeError>;

    /// CI test results for one commit (combined statuses + check runs).
    async fn fetch_test_report(
        &self,
        repo: &str,
        sha: &str,
        lease: &CredentialLease,
    ) -> Result<ForgeResponse<TestReport>, ForgeError>;

    /// Step past a permanently failing page, when the implementation can.
    /// Returning `None` makes the worker drain instead of stalling.
    fn advance_cursor(&self, _cursor: &PageCursor) -> Option<PageCursor> {
        None
    }
}

/// A forge handle bound to one held credential lease.
///
/// Wraps every [`ForgeApi`] call so the post-call rate state is recorded into
/// the lease immediately, keeping the credential pool's bookkeeping current
/// without the callers having to thread `RateInfo` around.
pub struct ForgeSession<'a> {
    api: &'a dyn ForgeApi,
    lease: &'a CredentialLease,
}

impl<'a> ForgeSession<'a> {
    pub fn new(api: &'a dyn ForgeApi, lease: &'a CredentialLease) -> Self {
        Self { api, lease }
    }

    pub fn lease(&self) -> &CredentialLease {
        self.lease
    }

    fn unwrap_recorded<T>(&self, resp: ForgeResponse<T>) -> T {
        self.lease.record(&resp.rate);
        resp.value
    }

    pub async fn list_pull_requests(
        &self,
        repo: &str,
        cursor: Option<&PageCursor>,
    ) -> Result<PullPage, ForgeError> {
        let resp = self.api.list_pull_requests(repo, cursor, self.lease).await?;
        Ok(self.unwrap_recorded(resp))
    }

    pub async fn fetch_diff(&self, repo: &str, number: u64) -> Result<String, ForgeError> {
        let resp = self.api.fetch_diff(repo, number, self.lease).await?;
        Ok(self.unwrap_recorded(resp))
    }

    pub async fn fetch_issue(&self, repo: &str, number: u64) -> Result<IssueRecord, ForgeError> {
        let resp = self.api.fetch_issue(repo, number, self.lease).await?;
        Ok(self.unwrap_recorded(resp))
    }

    pub async fn fetch_issue_comments(
        &self,
        repo: &str,
        number: u64,
    ) -> Result<Vec<IssueComment>, ForgeError> {
        let resp = self.api.fetch_issue_comments(repo, number, self.lease).await?;
        Ok(self.unwrap_recorded(resp))
    }

    pub async fn fetch_pull_commits(
        &self,
        repo: &str,
        number: u64,
    ) -> Result<Vec<CommitRef>, ForgeError> {
        let resp = self.api.fetch_pull_commits(repo, number, self.lease).await?;
        Ok(self.unwrap_recorded(resp))
    }

    pub async fn fetch_test_report(
        &self,
        repo: &str,
        sha: &str,
    ) -> Result<TestReport, ForgeError> {
        let resp = self.api.fetch_test_report(repo, sha, self.lease).await?;
        Ok(self.unwrap_recorded(resp))
    }
}

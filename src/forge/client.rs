//! HTTP implementation of the forge client against a GitHub-style REST API.
//!
//! Pagination is forward (`state=closed&sort=created&direction=asc`) so PR
//! numbers arrive in increasing order, and continuation follows the `Link`
//! header rather than assuming any page size. Rate-limit headers are parsed
//! off every response, including error responses.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;

use async_trait::async_trait;

use super::{
    CommitRef, DiscoveredRepository, ForgeApi, ForgeError, ForgeResponse, IssueComment,
    IssueRecord, PageCursor, PullPage, PullRequestCandidate, RateInfo, TestOutcome, TestReport,
};
use crate::credentials::CredentialLease;

const DEFAULT_BASE_URL: &str = "https://api.github.com";
const USER_AGENT: &str = "swe-harvest/0.1";
const API_VERSION: &str = "2022-11-28";

/// Forge client over one `reqwest` session.
pub struct HttpForgeClient {
    client: Client,
    base_url: String,
    per_page: u32,
}

impl HttpForgeClient {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            per_page: 100,
        }
    }

    fn get(&self, url: &str, lease: &CredentialLease, accept: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .header("User-Agent", USER_AGENT)
            .header("Accept", accept)
            .header("X-GitHub-Api-Version", API_VERSION)
            .header("Authorization", format!("Bearer {}", lease.token()))
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<(Response, RateInfo), ForgeError> {
        // Timeouts and connection drops are worth retrying in place.
        let response = request
            .send()
            .await
            .map_err(|e| ForgeError::Transient(format!("request failed: {e}")))?;

        let rate = RateInfo::from_headers(response.headers());
        let status = response.status();
        if status.is_success() {
            return Ok((response, rate));
        }
        Err(map_status(status, &rate))
    }

    async fn get_json(
        &self,
        url: &str,
        lease: &CredentialLease,
    ) -> Result<(Value, RateInfo, HeaderMap), ForgeError> {
        let (response, rate) = self
            .send(self.get(url, lease, "application/vnd.github+json"))
            .await?;
        let headers = response.headers().clone();
        let payload = response
            .json::<Value>()
            .await
            .map_err(|e| ForgeError::Malformed(format!("invalid JSON payload: {e}")))?;
        Ok((payload, rate, headers))
    }

    /// Discover the top repositories for a language, most-starred first.
    ///
    /// `pushed_after` restricts results to recently active repositories.
    pub async fn search_top_repositories(
        &self,
        language: &str,
        count: usize,
        pushed_after: Option<DateTime<Utc>>,
        lease: &CredentialLease,
    ) -> Result<ForgeResponse<Vec<DiscoveredRepository>>, ForgeError> {
        let mut query = format!("language:{language}");
        if let Some(after) = pushed_after {
            query.push_str(&format!("+pushed:>{}", after.format("%Y-%m-%d")));
        }
        let url = format!(
            "{}/search/repositories?q={}&sort=stars&order=desc&per_page={}",
            self.base_url,
            query,
            count.min(100)
        );

        let (payload, rate, _) = self.get_json(&url, lease).await?;
        let items = payload
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| ForgeError::Malformed("search payload missing 'items'".into()))?;

        let repos = items
            .iter()
            .filter_map(|item| {
                Some(DiscoveredRepository {
                    full_name: item.get("full_name")?.as_str()?.to_string(),
                    stars: item
                        .get("stargazers_count")
                        .and_then(Value::as_u64)
                        .and_then(|v| u32::try_from(v).ok())
                        .unwrap_or(0),
                })
            })
            .take(count)
            .collect();

        Ok(ForgeResponse::new(repos, rate))
    }
}

#[async_trait]
impl ForgeApi for HttpForgeClient {
    async fn list_pull_requests(
        &self,
        repo: &str,
        cursor: Option<&PageCursor>,
        lease: &CredentialLease,
    ) -> Result<ForgeResponse<PullPage>, ForgeError> {
        let url = match cursor {
            Some(c) => c.0.clone(),
            None => format!(
                "{}/repos/{}/pulls?state=closed&sort=created&direction=asc&per_page={}&page=1",
                self.base_url, repo, self.per_page
            ),
        };

        let (payload, rate, headers) = self.get_json(&url, lease).await?;
        let entries = payload
            .as_array()
            .ok_or_else(|| ForgeError::Malformed("pull listing is not an array".into()))?;

        let mut pulls = Vec::with_capacity(entries.len());
        for entry in entries {
            match parse_pull(entry) {
                Some(candidate) => pulls.push(candidate),
                None => {
                    tracing::warn!(repo = repo, "Dropping unparseable pull listing entry");
                }
            }
        }

        let next = parse_link_next(&headers).map(PageCursor);
        Ok(ForgeResponse::new(PullPage { pulls, next }, rate))
    }

    async fn fetch_diff(
        &self,
        repo: &str,
        number: u64,
        lease: &CredentialLease,
    ) -> Result<ForgeResponse<String>, ForgeError> {
        let url = format!("{}/repos/{}/pulls/{}", self.base_url, repo, number);
        let (response, rate) = self
            .send(self.get(&url, lease, "application/vnd.github.v3.diff"))
            .await?;
        let diff = response
            .text()
            .await
            .map_err(|e| ForgeError::Transient(format!("diff body read failed: {e}")))?;
        Ok(ForgeResponse::new(diff, rate))
    }

    async fn fetch_issue(
        &self,
        repo: &str,
        number: u64,
        lease: &CredentialLease,
    ) -> Result<ForgeResponse<IssueRecord>, ForgeError> {
        let url = format!("{}/repos/{}/issues/{}", self.base_url, repo, number);
        let (payload, rate, _) = self.get_json(&url, lease).await?;

        let issue = IssueRecord {
            number: payload
                .get("number")
                .and_then(Value::as_u64)
                .ok_or_else(|| ForgeError::Malformed("issue payload missing 'number'".into()))?,
            title: str_field(&payload, "title"),
            body: str_field(&payload, "body"),
        };
        Ok(ForgeResponse::new(issue, rate))
    }

    async fn fetch_issue_comments(
        &self,
        repo: &str,
        number: u64,
        lease: &CredentialLease,
    ) -> Result<ForgeResponse<Vec<IssueComment>>, ForgeError> {
        let url = format!(
            "{}/repos/{}/issues/{}/comments?per_page={}",
            self.base_url, repo, number, self.per_page
        );
        let (payload, rate, _) = self.get_json(&url, lease).await?;
        let entries = payload
            .as_array()
            .ok_or_else(|| ForgeError::Malformed("comment listing is not an array".into()))?;

        let comments = entries
            .iter()
            .filter_map(|entry| {
                Some(IssueComment {
                    body: str_field(entry, "body"),
                    updated_at: date_field(entry, "updated_at")?,
                })
            })
            .collect();
        Ok(ForgeResponse::new(comments, rate))
    }

    async fn fetch_pull_commits(
        &self,
        repo: &str,
        number: u64,
        lease: &CredentialLease,
    ) -> Result<ForgeResponse<Vec<CommitRef>>, ForgeError> {
        let url = format!(
            "{}/repos/{}/pulls/{}/commits?per_page={}",
            self.base_url, repo, number, self.per_page
        );
        let (payload, rate, _) = self.get_json(&url, lease).await?;
        let entries = payload
            .as_array()
            .ok_or_else(|| ForgeError::Malformed("commit listing is not an array".into()))?;

        let commits = entries
            .iter()
            .filter_map(|entry| {
                let authored_at = entry
                    .get("commit")
                    .and_then(|c| c.get("author"))
                    .and_then(|a| a.get("date"))
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<DateTime<Utc>>().ok())?;
                Some(CommitRef {
                    sha: entry.get("sha")?.as_str()?.to_string(),
                    authored_at,
                })
            })
            .collect();
        Ok(ForgeResponse::new(commits, rate))
    }

    async fn fetch_test_report(
        &self,
        repo: &str,
        sha: &str,
        lease: &CredentialLease,
    ) -> Result<ForgeResponse<TestReport>, ForgeError> {
        let status_url = format!("{}/repos/{}/commits/{}/status", self.base_url, repo, sha);
        let (payload, mut rate, _) = self.get_json(&status_url, lease).await?;
        let mut outcomes = parse_status_contexts(&payload);

        // Check runs supplement the legacy status API; missing check data is
        // not fatal as long as one of the two sources responded.
        let checks_url = format!(
            "{}/repos/{}/commits/{}/check-runs?per_page={}",
            self.base_url, repo, sha, self.per_page
        );
        match self.get_json(&checks_url, lease).await {
            Ok((checks, check_rate, _)) => {
                rate = check_rate;
                outcomes.extend(parse_check_runs(&checks));
            }
            Err(err) if !matches!(err, ForgeError::RateLimited { .. }) => {
                tracing::debug!(repo = repo, sha = sha, error = %err, "Check-run fetch failed");
            }
            Err(err) => return Err(err),
        }

        outcomes.sort_by(|a, b| a.id.cmp(&b.id));
        outcomes.dedup_by(|a, b| a.id == b.id);
        Ok(ForgeResponse::new(TestReport { outcomes }, rate))
    }

    fn advance_cursor(&self, cursor: &PageCursor) -> Option<PageCursor> {
        bump_page_param(&cursor.0).map(PageCursor)
    }
}

fn map_status(status: StatusCode, rate: &RateInfo) -> ForgeError {
    match status.as_u16() {
        403 | 429 => ForgeError::RateLimited {
            reset_at: rate.reset_at,
        },
        404 => ForgeError::NotFound,
        401 => ForgeError::Unauthorized,
        s if s >= 500 => ForgeError::Transient(format!("forge returned HTTP {s}")),
        s => ForgeError::Malformed(format!("unexpected HTTP status {s}")),
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn date_field(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    value
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<DateTime<Utc>>().ok())
}

/// Parse one entry of the pull listing payload.
fn parse_pull(entry: &Value) -> Option<PullRequestCandidate> {
    let changed_files = entry
        .get("changed_files")
        .and_then(Value::as_array)
        .map(|paths| {
            paths
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(PullRequestCandidate {
        number: entry.get("number")?.as_u64()?,
        title: str_field(entry, "title"),
        body: str_field(entry, "body"),
        created_at: date_field(entry, "created_at")?,
        merged_at: date_field(entry, "merged_at"),
        base_sha: entry
            .get("base")
            .and_then(|b| b.get("sha"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        merge_sha: entry
            .get("merge_commit_sha")
            .and_then(Value::as_str)
            .map(str::to_string),
        changed_files,
        linked_issues: Vec::new(),
    })
}

/// Extract the `rel="next"` target from a `Link` header.
fn parse_link_next(headers: &HeaderMap) -> Option<String> {
    let link = headers.get("link")?.to_str().ok()?;
    for part in link.split(',') {
        let mut sections = part.split(';');
        let url = sections.next()?.trim();
        if sections.any(|s| s.trim() == "rel=\"next\"") {
            return Some(url.trim_start_matches('<').trim_end_matches('>').to_string());
        }
    }
    None
}

/// Increment the `page` query parameter of a listing URL.
fn bump_page_param(url: &str) -> Option<String> {
    let (base, query) = url.split_once('?')?;
    let mut bumped = false;
    let params: Vec<String> = query
        .split('&')
        .map(|param| match param.strip_prefix("page=") {
            Some(value) => match value.parse::<u64>() {
                Ok(page) => {
                    bumped = true;
                    format!("page={}", page + 1)
                }
                Err(_) => param.to_string(),
            },
            None => param.to_string(),
        })
        .collect();
    bumped.then(|| format!("{}?{}", base, params.join("&")))
}

fn parse_status_contexts(payload: &Value) -> Vec<TestOutcome> {
    payload
        .get("statuses")
        .and_then(Value::as_array)
        .map(|statuses| {
            statuses
                .iter()
                .filter_map(|s| {
                    Some(TestOutcome {
                        id: s.get("context")?.as_str()?.to_string(),
                        passed: s.get("state").and_then(Value::as_str) == Some("success"),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_check_runs(payload: &Value) -> Vec<TestOutcome> {
    payload
        .get("check_runs")
        .and_then(Value::as_array)
        .map(|runs| {
            runs.iter()
                .filter_map(|r| {
                    Some(TestOutcome {
                        id: r.get("name")?.as_str()?.to_string(),
                        passed: r.get("conclusion").and_then(Value::as_str) == Some("success"),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;

    #[test]
    fn parse_pull_complete_entry() {
        let entry = json!({
            "number": 42,
            "title": "Fix parser crash",
            "body": "Fixes #41",
            "created_at": "2024-03-01T12:00:00Z",
            "merged_at": "2024-03-02T09:30:00Z",
            "base": {"sha": "abc123"},
            "merge_commit_sha": "def456",
            "changed_files": ["src/parser.rs", "tests/parser_test.rs"]
        });
        let pull = parse_pull(&entry).expect("should parse");
        assert_eq!(pull.number, 42);
        assert!(pull.merged_at.is_some());
        assert_eq!(pull.base_sha, "abc123");
        assert_eq!(pull.merge_sha.as_deref(), Some("def456"));
        assert_eq!(pull.changed_files.len(), 2);
    }

    #[test]
    fn parse_pull_unmerged_has_no_merge_time() {
        let entry = json!({
            "number": 7,
            "title": "WIP",
            "created_at": "2024-03-01T12:00:00Z",
            "merged_at": null,
            "base": {"sha": "abc"}
        });
        let pull = parse_pull(&entry).expect("should parse");
        assert!(pull.merged_at.is_none());
        assert!(pull.changed_files.is_empty());
    }

    #[test]
    fn parse_pull_missing_number_is_rejected() {
        assert!(parse_pull(&json!({"title": "x"})).is_none());
    }

    #[test]
    fn link_header_next_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "link",
            HeaderValue::from_static(
                "<https://api.github.com/repos/o/r/pulls?page=3>; rel=\"next\", \
                 <https://api.github.com/repos/o/r/pulls?page=9>; rel=\"last\"",
            ),
        );
        assert_eq!(
            parse_link_next(&headers).as_deref(),
            Some("https://api.github.com/repos/o/r/pulls?page=3")
        );
    }

    #[test]
    fn link_header_without_next() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "link",
            HeaderValue::from_static("<https://api.github.com/x?page=1>; rel=\"prev\""),
        );
        assert!(parse_link_next(&headers).is_none());
    }

    #[test]
    fn bump_page_skips_per_page_param() {
        let url = "https://api.github.com/repos/o/r/pulls?per_page=100&page=4";
        assert_eq!(
            bump_page_param(url).as_deref(),
            Some("https://api.github.com/repos/o/r/pulls?per_page=100&page=5")
        );
    }

    #[test]
    fn bump_page_without_page_param() {
        assert!(bump_page_param("https://api.github.com/repos/o/r/pulls").is_none());
    }

    #[test]
    fn status_mapping() {
        let rate = RateInfo::default();
        assert!(matches!(
            map_status(StatusCode::FORBIDDEN, &rate),
            ForgeError::RateLimited { .. }
        ));
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, &rate),
            ForgeError::RateLimited { .. }
        ));
        assert!(matches!(
            map_status(StatusCode::NOT_FOUND, &rate),
            ForgeError::NotFound
        ));
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, &rate),
            ForgeError::Unauthorized
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_GATEWAY, &rate),
            ForgeError::Transient(_)
        ));
    }

    #[test]
    fn test_report_sources_parse() {
        let statuses = json!({
            "statuses": [
                {"context": "ci/unit", "state": "success"},
                {"context": "ci/lint", "state": "failure"}
            ]
        });
        let outcomes = parse_status_contexts(&statuses);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].passed);
        assert!(!outcomes[1].passed);

        let checks = json!({
            "check_runs": [
                {"name": "tests (3.11)", "conclusion": "success"},
                {"name": "tests (3.12)", "conclusion": "timed_out"}
            ]
        });
        let outcomes = parse_check_runs(&checks);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].passed);
        assert!(!outcomes[1].passed);
    }
}

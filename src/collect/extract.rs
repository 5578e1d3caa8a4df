//! Turning one qualifying pull request into a task instance.
//!
//! Everything that can go wrong for a single PR degrades to a [`SkipReason`];
//! only credential exhaustion and retryable transport failures escape as
//! [`ForgeError`] so the worker can pause or back off.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::filter::FilterPolicy;
use super::CollectTarget;
use crate::forge::{ForgeError, ForgeSession, PullRequestCandidate, TestReport};

/// One mined task: a real bug fix with the tests that demonstrate it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInstance {
    pub repo: String,
    pub instance_id: String,
    pub base_commit: String,
    /// Non-test portion of the merged diff.
    pub patch: String,
    /// Test portion of the merged diff.
    pub test_patch: String,
    pub problem_statement: String,
    pub hints_text: String,
    pub created_at: DateTime<Utc>,
    /// Tests failing (or absent) before the patch and passing after.
    pub fail_to_pass: Vec<String>,
    /// Tests passing both before and after the patch.
    pub pass_to_pass: Vec<String>,
    pub environment_setup_commit: String,
    pub version: String,
}

/// Why a candidate was dropped instead of extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("no linked issue could be resolved")]
    NoLinkedIssue,
    #[error("diff contains no test changes")]
    NoTestChanges,
    #[error("diff contains no non-test changes")]
    EmptyPatch,
    #[error("no usable CI test data for the merge commit")]
    TestDataUnavailable,
    #[error("diff is not available")]
    DiffUnavailable,
    #[error("pull request payload is malformed")]
    MalformedPayload,
}

/// Extraction outcome for one candidate.
pub type Extraction = Result<TaskInstance, SkipReason>;

pub struct TaskExtractor {
    policy: FilterPolicy,
}

impl TaskExtractor {
    pub fn new(policy: FilterPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &FilterPolicy {
        &self.policy
    }

    /// Extract a task instance from one qualifying candidate.
    ///
    /// `Err` carries failures that should pause or be retried by the caller;
    /// per-PR dead ends come back as `Ok(Err(reason))`.
    pub async fn extract(
        &self,
        session: &ForgeSession<'_>,
        target: &CollectTarget,
        candidate: &PullRequestCandidate,
    ) -> Result<Extraction, ForgeError> {
        if candidate.linked_issues.is_empty() {
            return Ok(Err(SkipReason::NoLinkedIssue));
        }
        let Some(merge_sha) = candidate.merge_sha.as_deref() else {
            return Ok(Err(SkipReason::MalformedPayload));
        };
        if candidate.base_sha.is_empty() {
            return Ok(Err(SkipReason::MalformedPayload));
        }

        let diff = match session.fetch_diff(&target.repo, candidate.number).await {
            Ok(diff) => diff,
            Err(ForgeError::NotFound) => return Ok(Err(SkipReason::DiffUnavailable)),
            Err(ForgeError::Malformed(_)) => return Ok(Err(SkipReason::MalformedPayload)),
            Err(err) => return Err(err),
        };

        let (patch, test_patch) = split_patches(&diff, &self.policy);
        if patch.trim().is_empty() {
            return Ok(Err(SkipReason::EmptyPatch));
        }
        if test_patch.trim().is_empty() {
            return Ok(Err(SkipReason::NoTestChanges));
        }

        let problem_statement = self.problem_statement(session, target, candidate).await?;
        if problem_statement.trim().is_empty() {
            return Ok(Err(SkipReason::NoLinkedIssue));
        }
        let hints_text = self.hints(session, target, candidate).await?;

        let before = match session.fetch_test_report(&target.repo, &candidate.base_sha).await {
            Ok(report) => report,
            // A base commit with no CI data just means every test was absent.
            Err(ForgeError::NotFound) => TestReport::default(),
            Err(err) => return Err(err),
        };
        let after = match session.fetch_test_report(&target.repo, merge_sha).await {
            Ok(report) => report,
            Err(ForgeError::NotFound) => return Ok(Err(SkipReason::TestDataUnavailable)),
            Err(err) => return Err(err),
        };

        let (fail_to_pass, pass_to_pass) = compare_reports(&before, &after);
        if fail_to_pass.is_empty() {
            return Ok(Err(SkipReason::TestDataUnavailable));
        }

        Ok(Ok(TaskInstance {
            repo: target.repo.clone(),
            instance_id: format!("{}-{}", target.file_stem(), candidate.number),
            base_commit: candidate.base_sha.clone(),
            patch,
            test_patch,
            problem_statement,
            hints_text,
            created_at: candidate.created_at,
            fail_to_pass,
            pass_to_pass,
            environment_setup_commit: candidate.base_sha.clone(),
            version: target.version.clone(),
        }))
    }

    /// Concatenated text of every resolvable linked issue.
    async fn problem_statement(
        &self,
        session: &ForgeSession<'_>,
        target: &CollectTarget,
        candidate: &PullRequestCandidate,
    ) -> Result<String, ForgeError> {
        let mut text = String::new();
        for &number in &candidate.linked_issues {
            match session.fetch_issue(&target.repo, number).await {
                Ok(issue) => {
                    text.push_str(&issue.title);
                    text.push('\n');
                    text.push_str(&issue.body);
                    text.push('\n');
                }
                Err(ForgeError::NotFound) | Err(ForgeError::Malformed(_)) => {
                    tracing::debug!(
                        repo = %target.repo,
                        issue = number,
                        "Linked issue not resolvable"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(text)
    }

    /// Issue discussion written before the fix existed. Best-effort.
    async fn hints(
        &self,
        session: &ForgeSession<'_>,
        target: &CollectTarget,
        candidate: &PullRequestCandidate,
    ) -> Result<String, ForgeError> {
        let commits = match session.fetch_pull_commits(&target.repo, candidate.number).await {
            Ok(commits) => commits,
            Err(err) if matches!(err, ForgeError::RateLimited { .. }) => return Err(err),
            Err(_) => return Ok(String::new()),
        };
        let Some(first_commit_at) = commits.iter().map(|c| c.authored_at).min() else {
            return Ok(String::new());
        };

        let mut hints = Vec::new();
        for &number in &candidate.linked_issues {
            let comments = match session.fetch_issue_comments(&target.repo, number).await {
                Ok(comments) => comments,
                Err(err) if matches!(err, ForgeError::RateLimited { .. }) => return Err(err),
                Err(_) => continue,
            };
            for comment in comments {
                if comment.updated_at < first_commit_at {
                    hints.push(comment.body);
                }
            }
        }
        Ok(hints.join("\n"))
    }
}

/// Partition a unified diff into (non-test patch, test patch).
///
/// File blocks are delimited by `diff --git` lines; a block belongs to the
/// test patch iff its target path is a test path under the policy.
pub fn split_patches(raw: &str, policy: &FilterPolicy) -> (String, String) {
    let mut patch = String::new();
    let mut test_patch = String::new();
    let mut current_is_test = false;
    let mut in_file = false;

    for line in raw.lines() {
        if let Some(path) = parse_diff_file_name(line) {
            in_file = true;
            current_is_test = policy.is_test_path(&path);
        }
        if !in_file {
            continue;
        }
        let out = if current_is_test { &mut test_patch } else { &mut patch };
        out.push_str(line);
        out.push('\n');
    }

    (patch, test_patch)
}

fn parse_diff_file_name(line: &str) -> Option<String> {
    if !line.starts_with("diff --git a/") {
        return None;
    }
    let tokens = line.split_whitespace().collect::<Vec<_>>();
    // Prefer the post-image path so renames land on the new name.
    tokens
        .last()
        .filter(|_| tokens.len() >= 4)
        .map(|path| path.trim_start_matches("b/").to_string())
}

/// Derive fail-to-pass and pass-to-pass sets from before/after CI reports.
///
/// A test absent from the before-report counts as failing there. Identifiers
/// keep the after-report's order.
pub fn compare_reports(before: &TestReport, after: &TestReport) -> (Vec<String>, Vec<String>) {
    let mut fail_to_pass = Vec::new();
    let mut pass_to_pass = Vec::new();

    for outcome in &after.outcomes {
        if !outcome.passed {
            continue;
        }
        let passed_before = before
            .outcomes
            .iter()
            .find(|b| b.id == outcome.id)
            .map(|b| b.passed)
            .unwrap_or(false);
        if passed_before {
            pass_to_pass.push(outcome.id.clone());
        } else {
            fail_to_pass.push(outcome.id.clone());
        }
    }

    (fail_to_pass, pass_to_pass)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::TestOutcome;

    const SAMPLE_DIFF: &str = "\
diff --git a/src/parser.rs b/src/parser.rs
index 111..222 100644
--- a/src/parser.rs
+++ b/src/parser.rs
@@ -1,3 +1,3 @@
-old
+new
diff --git a/tests/parser_test.rs b/tests/parser_test.rs
index 333..444 100644
--- a/tests/parser_test.rs
+++ b/tests/parser_test.rs
@@ -1,1 +1,2 @@
 existing
+new assertion
";

    #[test]
    fn splits_source_and_test_blocks() {
        let (patch, test_patch) = split_patches(SAMPLE_DIFF, &FilterPolicy::default());
        assert!(patch.contains("a/src/parser.rs"));
        assert!(patch.contains("+new"));
        assert!(!patch.contains("parser_test"));
        assert!(test_patch.contains("a/tests/parser_test.rs"));
        assert!(test_patch.contains("+new assertion"));
        assert!(!test_patch.contains("src/parser.rs"));
    }

    #[test]
    fn source_only_diff_has_empty_test_patch() {
        let diff = "diff --git a/src/lib.rs b/src/lib.rs\n+change\n";
        let (patch, test_patch) = split_patches(diff, &FilterPolicy::default());
        assert!(!patch.is_empty());
        assert!(test_patch.is_empty());
    }

    #[test]
    fn rename_uses_post_image_path() {
        let line = "diff --git a/src/old.rs b/tests/new_test.rs";
        assert_eq!(
            parse_diff_file_name(line).as_deref(),
            Some("tests/new_test.rs")
        );
        assert_eq!(parse_diff_file_name("diff --git a/only"), None);
        assert_eq!(parse_diff_file_name("+++ b/src/lib.rs"), None);
    }

    fn report(pairs: &[(&str, bool)]) -> TestReport {
        TestReport {
            outcomes: pairs
                .iter()
                .map(|&(id, passed)| TestOutcome {
                    id: id.to_string(),
                    passed,
                })
                .collect(),
        }
    }

    #[test]
    fn report_comparison_classes() {
        let before = report(&[("a", true), ("b", false)]);
        let after = report(&[("a", true), ("b", true), ("c", true), ("d", false)]);

        let (f2p, p2p) = compare_reports(&before, &after);
        // b failed before, c was absent before: both count as fail-to-pass.
        assert_eq!(f2p, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(p2p, vec!["a".to_string()]);
    }

    #[test]
    fn failing_after_is_never_kept() {
        let (f2p, p2p) = compare_reports(&report(&[]), &report(&[("x", false)]));
        assert!(f2p.is_empty());
        assert!(p2p.is_empty());
    }
}

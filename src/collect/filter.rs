//! Pure candidate filtering: decides which merged PRs are worth extracting.
//!
//! The policy is data, not code: test-path rules and linked-issue keywords can
//! be overridden from a YAML file so new ecosystems don't need a release.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use super::config::ConfigError;
use super::CollectTarget;
use crate::forge::PullRequestCandidate;

/// Rules for classifying changed files and resolving linked issues.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterPolicy {
    /// Exact directory segments that mark everything below them as tests.
    pub test_dir_segments: Vec<String>,
    /// File-stem prefixes, e.g. `test_` for `test_api.py`.
    pub test_stem_prefixes: Vec<String>,
    /// File-stem suffixes, e.g. `_test` for `foo_test.go`.
    pub test_stem_suffixes: Vec<String>,
    /// File stems that are tests on their own, e.g. `test` for `test.rs`.
    pub test_stem_exact: Vec<String>,
    /// Infixes inside the full file name, e.g. `.test.` for `foo.test.ts`.
    pub test_name_infixes: Vec<String>,
    /// Words that mark an issue reference as a resolution link.
    pub link_keywords: Vec<String>,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self {
            test_dir_segments: [
                "test",
                "tests",
                "testing",
                "spec",
                "specs",
                "e2e",
                "__tests__",
                "testsuite",
            ]
            .map(str::to_string)
            .to_vec(),
            test_stem_prefixes: vec!["test_".to_string()],
            test_stem_suffixes: vec!["_test".to_string()],
            test_stem_exact: vec!["test".to_string()],
            test_name_infixes: vec![".test.".to_string(), ".spec.".to_string()],
            link_keywords: [
                "close", "closes", "closed", "fix", "fixes", "fixed", "resolve", "resolves",
                "resolved",
            ]
            .map(str::to_string)
            .to_vec(),
        }
    }
}

impl FilterPolicy {
    /// Load a policy from YAML; absent fields fall back to the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::PolicyRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::PolicyParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Whether a repository-relative path names a test file.
    pub fn is_test_path(&self, path: &str) -> bool {
        let lowered = path.to_ascii_lowercase();
        let mut segments = lowered.split('/').peekable();

        let mut file_name = "";
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                file_name = segment;
                break;
            }
            if self.test_dir_segments.iter().any(|s| s == segment) {
                return true;
            }
        }

        let stem = file_name.split('.').next().unwrap_or(file_name);
        self.test_stem_prefixes.iter().any(|p| stem.starts_with(p.as_str()))
            || self.test_stem_suffixes.iter().any(|s| stem.ends_with(s.as_str()))
            || self.test_stem_exact.iter().any(|e| e == stem)
            || self.test_name_infixes.iter().any(|i| file_name.contains(i.as_str()))
    }

    /// Issue numbers referenced with a resolution keyword in the given text.
    ///
    /// HTML comments are stripped first so PR-template boilerplate like
    /// `<!-- Fixes #123 -->` does not count. Results are deduplicated and
    /// sorted ascending.
    pub fn resolved_issues(&self, title: &str, body: &str) -> Vec<u64> {
        let comment = html_comment_re();
        let reference = issue_reference_re();

        let mut issues = BTreeSet::new();
        for text in [title, body] {
            let cleaned = comment.replace_all(text, "");
            for capture in reference.captures_iter(&cleaned) {
                let keyword = capture[1].to_ascii_lowercase();
                if !self.link_keywords.iter().any(|k| k == &keyword) {
                    continue;
                }
                if let Ok(number) = capture[2].parse::<u64>() {
                    issues.insert(number);
                }
            }
        }
        issues.into_iter().collect()
    }
}

fn html_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").expect("static pattern"))
}

fn issue_reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w+)\s+#(\d+)").expect("static pattern"))
}

/// Whether a candidate qualifies for extraction. Pure, no I/O.
///
/// The changed-file mix is only enforced when the listing actually reported
/// file paths; an empty list defers the check to the extractor's diff split.
pub fn is_qualifying(
    candidate: &PullRequestCandidate,
    target: &CollectTarget,
    policy: &FilterPolicy,
) -> bool {
    let Some(merged_at) = candidate.merged_at else {
        return false;
    };
    if let Some(cutoff) = target.cutoff {
        if merged_at < cutoff {
            return false;
        }
    }
    if candidate.linked_issues.is_empty() {
        return false;
    }
    if !candidate.changed_files.is_empty() {
        let tests = candidate
            .changed_files
            .iter()
            .filter(|p| policy.is_test_path(p))
            .count();
        if tests == 0 || tests == candidate.changed_files.len() {
            return false;
        }
    }
    true
}

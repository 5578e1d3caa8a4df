//! Collection engine: mining merged pull requests into task instances.
//!
//! The pipeline per repository is list -> filter -> extract -> persist, run by
//! a [`worker::RepositoryWorker`] and fanned out across repositories by the
//! [`scheduler::CollectionScheduler`].

pub mod config;
pub mod extract;
pub mod filter;
pub mod progress;
pub mod scheduler;
pub mod store;
pub mod worker;

use chrono::{DateTime, Utc};

/// One repository to collect, with its per-repo knobs resolved.
#[derive(Debug, Clone)]
pub struct CollectTarget {
    /// `owner/name`.
    pub repo: String,
    /// Skip PRs merged before this instant (inclusive cutoff).
    pub cutoff: Option<DateTime<Utc>>,
    /// Stop after scanning this many PRs, when set.
    pub max_pulls: Option<u64>,
    /// Re-scan even if a previous run drained the repository.
    pub refresh: bool,
    /// Version tag stamped onto emitted instances.
    pub version: String,
}

impl CollectTarget {
    /// The `owner__name` stem used for instance ids and output files.
    pub fn file_stem(&self) -> String {
        self.repo.replace('/', "__")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_stem_replaces_separator() {
        let target = CollectTarget {
            repo: "octo/widgets".into(),
            cutoff: None,
            max_pulls: None,
            refresh: false,
            version: "0.1".into(),
        };
        assert_eq!(target.file_stem(), "octo__widgets");
    }
}

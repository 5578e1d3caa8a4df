//! swe-harvest: concurrent collection of SWE task instances from pull request history.
//!
//! This library walks the closed-PR history of a set of repositories on a
//! GitHub-style forge, filters candidate pull requests, extracts complete task
//! records (problem statement, patch, test patch, before/after test outcomes)
//! and appends them to per-repository record streams, sharing a pool of
//! rate-limited API credentials across many concurrent repository workers.

pub mod cli;
pub mod collect;
pub mod credentials;
pub mod forge;

// Re-export the types most callers need.
pub use collect::config::{CollectConfig, ConfigError};
pub use collect::extract::{SkipReason, TaskInstance};
pub use collect::scheduler::{CollectionScheduler, RunSummary};
pub use collect::store::PersistError;
pub use forge::ForgeError;

//! On-disk layout: per-repository JSONL task files plus a progress record.
//!
//! Distinct repositories never share files, so workers need no cross-file
//! locking. Task appends are flushed and synced before the progress record
//! advances; a crash between the two is resolved on restart by the dedup set.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::extract::TaskInstance;

/// Any storage failure is fatal for the whole run.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("cannot create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot encode record for {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt progress record {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Where a repository's scan left off.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressRecord {
    /// Highest PR number already scanned (collected or skipped).
    pub last_pull_scanned: u64,
    /// Instance ids already appended to the task file.
    pub persisted: BTreeSet<String>,
    /// Listing cursor for the next unscanned page, when mid-scan. A resumed
    /// run starts listing here instead of from page one.
    #[serde(default)]
    pub next_cursor: Option<String>,
    /// Set once listing reached the end; a later run is a no-op unless
    /// refreshing.
    pub drained: bool,
}

/// Append-only persistence rooted at one output directory.
#[derive(Debug, Clone)]
pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| PersistError::CreateDir {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_path(&self, file_stem: &str) -> PathBuf {
        self.root.join(format!("{file_stem}-task-instances.jsonl"))
    }

    pub fn progress_path(&self, file_stem: &str) -> PathBuf {
        self.root.join(format!("{file_stem}-progress.json"))
    }

    /// Append one task instance and sync it to disk before returning.
    pub fn append_task(&self, file_stem: &str, task: &TaskInstance) -> Result<(), PersistError> {
        let path = self.task_path(file_stem);
        let line = serde_json::to_string(task).map_err(|source| PersistError::Encode {
            path: path.clone(),
            source,
        })?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| PersistError::Write {
                path: path.clone(),
                source,
            })?;
        writeln!(file, "{line}").map_err(|source| PersistError::Write {
            path: path.clone(),
            source,
        })?;
        file.sync_all().map_err(|source| PersistError::Write {
            path: path.clone(),
            source,
        })
    }

    /// Replace the progress record atomically (write temp, rename).
    pub fn write_progress(
        &self,
        file_stem: &str,
        progress: &ProgressRecord,
    ) -> Result<(), PersistError> {
        let path = self.progress_path(file_stem);
        let tmp = path.with_extension("json.tmp");

        let payload =
            serde_json::to_vec_pretty(progress).map_err(|source| PersistError::Encode {
                path: path.clone(),
                source,
            })?;

        let mut file = File::create(&tmp).map_err(|source| PersistError::Write {
            path: tmp.clone(),
            source,
        })?;
        file.write_all(&payload)
            .and_then(|_| file.sync_all())
            .map_err(|source| PersistError::Write {
                path: tmp.clone(),
                source,
            })?;
        fs::rename(&tmp, &path).map_err(|source| PersistError::Write { path, source })
    }

    /// Load the progress record, or the zero record if none exists.
    pub fn read_progress(&self, file_stem: &str) -> Result<ProgressRecord, PersistError> {
        let path = self.progress_path(file_stem);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ProgressRecord::default())
            }
            Err(source) => return Err(PersistError::Read { path, source }),
        };
        serde_json::from_str(&raw).map_err(|source| PersistError::Decode { path, source })
    }

    /// Instance ids present in the task file, for restart dedup.
    pub fn persisted_ids(&self, file_stem: &str) -> Result<BTreeSet<String>, PersistError> {
        let path = self.task_path(file_stem);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeSet::new())
            }
            Err(source) => return Err(PersistError::Read { path, source }),
        };

        let mut ids = BTreeSet::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let task: TaskInstance =
                serde_json::from_str(line).map_err(|source| PersistError::Decode {
                    path: path.clone(),
                    source,
                })?;
            ids.insert(task.instance_id);
        }
        Ok(ids)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn task(id: &str) -> TaskInstance {
        TaskInstance {
            repo: "octo/widgets".into(),
            instance_id: id.into(),
            base_commit: "base".into(),
            patch: "diff --git a/src/lib.rs b/src/lib.rs\n+fix\n".into(),
            test_patch: "diff --git a/tests/t.rs b/tests/t.rs\n+assert\n".into(),
            problem_statement: "crash".into(),
            hints_text: String::new(),
            created_at: Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap(),
            fail_to_pass: vec!["t::new".into()],
            pass_to_pass: vec![],
            environment_setup_commit: "base".into(),
            version: "0.1".into(),
        }
    }

    #[test]
    fn appended_tasks_come_back_as_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();

        store.append_task("octo__widgets", &task("octo__widgets-1")).unwrap();
        store.append_task("octo__widgets", &task("octo__widgets-2")).unwrap();

        let ids = store.persisted_ids("octo__widgets").unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("octo__widgets-1"));

        let raw = std::fs::read_to_string(store.task_path("octo__widgets")).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[test]
    fn progress_roundtrip_and_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();

        assert_eq!(
            store.read_progress("octo__widgets").unwrap(),
            ProgressRecord::default()
        );

        let mut progress = ProgressRecord {
            last_pull_scanned: 9,
            persisted: BTreeSet::from(["octo__widgets-7".to_string()]),
            next_cursor: Some("3".to_string()),
            drained: true,
        };
        store.write_progress("octo__widgets", &progress).unwrap();
        assert_eq!(store.read_progress("octo__widgets").unwrap(), progress);

        // Overwrite is a full replace, not a merge.
        progress.drained = false;
        store.write_progress("octo__widgets", &progress).unwrap();
        assert!(!store.read_progress("octo__widgets").unwrap().drained);
    }

    #[test]
    fn progress_without_cursor_field_still_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();

        std::fs::write(
            store.progress_path("octo__widgets"),
            r#"{"last_pull_scanned":4,"persisted":[],"drained":false}"#,
        )
        .unwrap();

        let progress = store.read_progress("octo__widgets").unwrap();
        assert_eq!(progress.last_pull_scanned, 4);
        assert!(progress.next_cursor.is_none());
    }

    #[test]
    fn repositories_do_not_share_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();

        store.append_task("a__x", &task("a__x-1")).unwrap();
        store.append_task("b__y", &task("b__y-1")).unwrap();

        assert_eq!(store.persisted_ids("a__x").unwrap().len(), 1);
        assert_eq!(store.persisted_ids("b__y").unwrap().len(), 1);
        assert_ne!(store.task_path("a__x"), store.task_path("b__y"));
    }
}

//! Durable deduplication ledger.
//!
//! Maps each repository to the last release tag that was reported for it.
//! The whole map sits behind one mutex; every committed change rewrites the
//! JSON snapshot on disk before the lock is released, so a "new" decision is
//! never returned before it has been made durable (or the write has failed
//! and been reported).

use crate::types::RepositoryIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("failed to create state directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to serialize ledger: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Last reported release of one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub owner: String,
    pub repository: String,
    pub latest_tag: String,
    pub last_notified: DateTime<Utc>,
}

impl ReleaseRecord {
    pub fn identity(&self) -> RepositoryIdentity {
        RepositoryIdentity::new(self.owner.clone(), self.repository.clone())
    }
}

/// Result of [`Ledger::check_and_commit_if_new`].
#[derive(Debug)]
pub enum CommitOutcome {
    /// The tag was already recorded; nothing changed.
    Unchanged,
    /// The tag was new and is now recorded in memory and on disk.
    Committed,
    /// The tag was new and is recorded in memory, but the snapshot could not
    /// be written. The decision stands for this process.
    CommittedUnpersisted(LedgerError),
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        !matches!(self, CommitOutcome::Unchanged)
    }
}

pub struct Ledger {
    path: PathBuf,
    records: Mutex<BTreeMap<String, ReleaseRecord>>,
}

impl Ledger {
    /// `$HOME/.notify/state.json`, or `.notify/state.json` when no home is known.
    pub fn default_path() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".notify")
            .join("state.json")
    }

    /// Opens the ledger at `path`, creating its directory if needed and
    /// loading an existing snapshot.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LedgerError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let records = if path.exists() {
            let raw = fs::read(&path).map_err(|source| LedgerError::Read {
                path: path.clone(),
                source,
            })?;
            if raw.iter().all(u8::is_ascii_whitespace) {
                BTreeMap::new()
            } else {
                serde_json::from_slice(&raw).map_err(|source| LedgerError::Corrupt {
                    path: path.clone(),
                    source,
                })?
            }
        } else {
            BTreeMap::new()
        };

        info!("Opened ledger at {} with {} records", path.display(), records.len());
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ReleaseRecord>> {
        // A panic while holding the lock cannot leave a half-written record
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True iff no record exists for `identity` or its stored tag differs.
    pub fn is_new(&self, identity: &RepositoryIdentity, tag: &str) -> bool {
        self.lock()
            .get(&identity.key())
            .map_or(true, |record| record.latest_tag != tag)
    }

    /// Stored tag for `identity`, empty if none.
    pub fn latest_tag(&self, identity: &RepositoryIdentity) -> String {
        self.lock()
            .get(&identity.key())
            .map(|record| record.latest_tag.clone())
            .unwrap_or_default()
    }

    /// Atomically records `tag` for `identity` if it is new. Among concurrent
    /// callers with the same arguments exactly one sees a committed outcome.
    pub fn check_and_commit_if_new(&self, identity: &RepositoryIdentity, tag: &str) -> CommitOutcome {
        let key = identity.key();
        let mut records = self.lock();

        if records.get(&key).is_some_and(|record| record.latest_tag == tag) {
            crate::metrics::ledger::unchanged();
            return CommitOutcome::Unchanged;
        }

        records.insert(
            key,
            ReleaseRecord {
                owner: identity.owner.clone(),
                repository: identity.name.clone(),
                latest_tag: tag.to_string(),
                last_notified: Utc::now(),
            },
        );
        crate::metrics::ledger::committed();

        match self.persist(&records) {
            Ok(()) => {
                debug!("Committed {} at {}", identity, tag);
                CommitOutcome::Committed
            }
            Err(e) => {
                warn!("Committed {} at {} in memory only: {}", identity, tag, e);
                crate::metrics::ledger::persist_error();
                CommitOutcome::CommittedUnpersisted(e)
            }
        }
    }

    /// Sorted copy of every record.
    pub fn records(&self) -> Vec<ReleaseRecord> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Caller holds the lock. Writes a sibling temp file and renames it over
    // the snapshot so readers never observe a partial file.
    fn persist(&self, records: &BTreeMap<String, ReleaseRecord>) -> Result<(), LedgerError> {
        let data = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data).map_err(|source| LedgerError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| LedgerError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn identity() -> RepositoryIdentity {
        RepositoryIdentity::new("test-owner", "test-repo")
    }

    #[test]
    fn test_concurrent_commit_has_single_winner() {
        let dir = tempdir().unwrap();
        let ledger = Arc::new(Ledger::open(dir.path().join("state.json")).unwrap());

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..64)
                .map(|_| {
                    let ledger = Arc::clone(&ledger);
                    scope.spawn(move || ledger.check_and_commit_if_new(&identity(), "v1.0.0").is_committed())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap() as usize).sum()
        });

        assert_eq!(winners, 1);
        assert_eq!(ledger.latest_tag(&identity()), "v1.0.0");
    }

    #[test]
    fn test_tag_change_detection() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("state.json")).unwrap();

        assert!(ledger.check_and_commit_if_new(&identity(), "v1").is_committed());
        assert!(!ledger.check_and_commit_if_new(&identity(), "v1").is_committed());
        assert!(ledger.check_and_commit_if_new(&identity(), "v2").is_committed());
        assert_eq!(ledger.latest_tag(&identity()), "v2");
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_is_new_does_not_mutate() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("state.json")).unwrap();

        assert!(ledger.is_new(&identity(), "v1"));
        assert!(ledger.is_new(&identity(), "v1"));
        assert!(ledger.is_empty());
        assert_eq!(ledger.latest_tag(&identity()), "");
    }

    #[test]
    fn test_reload_from_same_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let id = RepositoryIdentity::new("a", "b");

        {
            let ledger = Ledger::open(&path).unwrap();
            assert!(ledger.check_and_commit_if_new(&id, "v1.0.0").is_committed());
        }

        let reloaded = Ledger::open(&path).unwrap();
        assert_eq!(reloaded.latest_tag(&id), "v1.0.0");
        assert!(!reloaded.is_new(&id, "v1.0.0"));
    }

    #[test]
    fn test_snapshot_field_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let ledger = Ledger::open(&path).unwrap();
        ledger.check_and_commit_if_new(&RepositoryIdentity::new("a", "b"), "v1");

        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let record = &raw["a/b"];
        assert_eq!(record["owner"], "a");
        assert_eq!(record["repository"], "b");
        assert_eq!(record["latest_tag"], "v1");
        assert!(record["last_notified"].is_string());
    }

    #[test]
    fn test_persist_failure_keeps_in_memory_decision() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let ledger = Ledger::open(state_dir.join("state.json")).unwrap();
        fs::remove_dir_all(&state_dir).unwrap();

        let outcome = ledger.check_and_commit_if_new(&identity(), "v1");
        assert!(matches!(outcome, CommitOutcome::CommittedUnpersisted(LedgerError::Write { .. })));
        assert_eq!(ledger.latest_tag(&identity()), "v1");
        assert!(!ledger.check_and_commit_if_new(&identity(), "v1").is_committed());
    }

    #[test]
    fn test_corrupt_snapshot_fails_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(Ledger::open(&path), Err(LedgerError::Corrupt { .. })));
    }
}

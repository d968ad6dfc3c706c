//! Storage backend for leased resources.
//!
//! `FsResourceBackend` keeps one directory per resource under `<root>/teams/`
//! and one lease record per resource under `<root>/leases/<name>.json`.
//! Every method takes a [`ResourceName`], so raw strings never reach a path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::name::ResourceName;
use crate::errors::ResourceError;

/// Marker file a worker drops into a resource's storage while it is active.
pub const BUSY_MARKER: &str = ".busy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Leased,
    Released,
}

/// Persisted lease of a resource by a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub name: String,
    pub owner_run: String,
    pub phase: String,
    pub state: LeaseState,
    /// RFC 3339; kept as a string so a malformed value can still be aged
    pub created_at: String,
}

/// Operations the cleanup guard and dispatcher need from a resource store.
pub trait ResourceBackend: Send + Sync {
    /// Whether backing storage exists.
    fn exists(&self, name: &ResourceName) -> Result<bool, ResourceError>;

    /// Create storage and a lease record for `phase` of `owner_run`.
    fn lease(&self, name: &ResourceName, owner_run: &str, phase: &str) -> Result<(), ResourceError>;

    /// Current lease record, if any.
    fn lease_info(&self, name: &ResourceName) -> Result<Option<LeaseRecord>, ResourceError>;

    /// Ownership-transfer primitive: give the resource back and drop its storage.
    fn release(&self, name: &ResourceName) -> Result<(), ResourceError>;

    /// Remove backing storage. Removing missing storage succeeds.
    fn remove_storage(&self, name: &ResourceName) -> Result<(), ResourceError>;

    /// Recreate empty storage so `release` can recognise the resource again.
    fn create_placeholder(&self, name: &ResourceName) -> Result<(), ResourceError>;

    /// Raw names of every resource with storage or a live lease. Unvalidated.
    fn list(&self) -> Result<Vec<String>, ResourceError>;

    /// Delete released lease records created before `before`. Returns the
    /// names whose records were removed.
    fn prune_released(&self, _before: DateTime<Utc>) -> Result<Vec<String>, ResourceError> {
        Ok(Vec::new())
    }

    /// Whether the resource holds a live lease.
    fn is_leased(&self, name: &ResourceName) -> Result<bool, ResourceError> {
        Ok(self
            .lease_info(name)?
            .is_some_and(|l| l.state == LeaseState::Leased))
    }
}

/// A lease file as found on disk.
enum StoredLease {
    Missing,
    Valid(LeaseRecord),
    Unreadable(serde_json::Error),
}

pub struct FsResourceBackend {
    teams_dir: PathBuf,
    leases_dir: PathBuf,
}

impl FsResourceBackend {
    pub fn new(root: &Path) -> Self {
        Self {
            teams_dir: root.join("teams"),
            leases_dir: root.join("leases"),
        }
    }

    pub fn storage_path(&self, name: &ResourceName) -> PathBuf {
        self.teams_dir.join(name.as_str())
    }

    fn lease_path(&self, name: &ResourceName) -> PathBuf {
        self.leases_dir.join(format!("{}.json", name))
    }

    fn io(name: &ResourceName) -> impl Fn(std::io::Error) -> ResourceError + '_ {
        move |source| ResourceError::Io {
            name: name.to_string(),
            source,
        }
    }

    fn write_lease(&self, name: &ResourceName, record: &LeaseRecord) -> Result<(), ResourceError> {
        fs::create_dir_all(&self.leases_dir).map_err(Self::io(name))?;
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| Self::io(name)(std::io::Error::other(e)))?;
        fs::write(self.lease_path(name), json).map_err(Self::io(name))
    }

    fn read_lease(&self, name: &ResourceName) -> Result<StoredLease, ResourceError> {
        let content = match fs::read_to_string(self.lease_path(name)) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoredLease::Missing),
            Err(e) => return Err(Self::io(name)(e)),
        };
        Ok(match serde_json::from_str(&content) {
            Ok(record) => StoredLease::Valid(record),
            Err(e) => StoredLease::Unreadable(e),
        })
    }

    fn check_not_busy(&self, name: &ResourceName) -> Result<(), ResourceError> {
        if self.storage_path(name).join(BUSY_MARKER).exists() {
            return Err(ResourceError::Busy {
                name: name.to_string(),
            });
        }
        Ok(())
    }
}

impl ResourceBackend for FsResourceBackend {
    fn exists(&self, name: &ResourceName) -> Result<bool, ResourceError> {
        Ok(self.storage_path(name).is_dir())
    }

    fn lease(&self, name: &ResourceName, owner_run: &str, phase: &str) -> Result<(), ResourceError> {
        fs::create_dir_all(self.storage_path(name)).map_err(Self::io(name))?;
        self.write_lease(
            name,
            &LeaseRecord {
                name: name.to_string(),
                owner_run: owner_run.to_string(),
                phase: phase.to_string(),
                state: LeaseState::Leased,
                created_at: Utc::now().to_rfc3339(),
            },
        )
    }

    fn lease_info(&self, name: &ResourceName) -> Result<Option<LeaseRecord>, ResourceError> {
        match self.read_lease(name)? {
            StoredLease::Missing => Ok(None),
            StoredLease::Valid(record) => Ok(Some(record)),
            StoredLease::Unreadable(e) => Err(Self::io(name)(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e,
            ))),
        }
    }

    fn release(&self, name: &ResourceName) -> Result<(), ResourceError> {
        let mut record = match self.read_lease(name)? {
            StoredLease::Missing => return Ok(()),
            StoredLease::Valid(record) if record.state == LeaseState::Released => return Ok(()),
            StoredLease::Valid(record) => record,
            StoredLease::Unreadable(e) => {
                // Nothing in the record can be trusted; give the storage back and
                // replace the record with a released one of unknown origin.
                warn!(resource = %name, "Replacing unreadable lease record: {}", e);
                self.check_not_busy(name)?;
                self.remove_storage(name)?;
                return self.write_lease(
                    name,
                    &LeaseRecord {
                        name: name.to_string(),
                        owner_run: String::new(),
                        phase: String::new(),
                        state: LeaseState::Released,
                        created_at: String::new(),
                    },
                );
            }
        };

        let storage = self.storage_path(name);
        if !storage.is_dir() {
            return Err(ResourceError::Diverged {
                name: name.to_string(),
            });
        }
        self.check_not_busy(name)?;

        fs::remove_dir_all(&storage).map_err(Self::io(name))?;
        record.state = LeaseState::Released;
        self.write_lease(name, &record)
    }

    fn remove_storage(&self, name: &ResourceName) -> Result<(), ResourceError> {
        match fs::remove_dir_all(self.storage_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io(name)(e)),
        }
    }

    fn create_placeholder(&self, name: &ResourceName) -> Result<(), ResourceError> {
        fs::create_dir_all(self.storage_path(name)).map_err(Self::io(name))
    }

    fn list(&self) -> Result<Vec<String>, ResourceError> {
        let mut names = Vec::new();

        if let Ok(entries) = fs::read_dir(&self.teams_dir) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
        }

        if let Ok(entries) = fs::read_dir(&self.leases_dir) {
            for entry in entries.flatten() {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                let Some(stem) = file_name.strip_suffix(".json") else {
                    continue;
                };
                // Released records are history, not resources.
                let released = fs::read_to_string(entry.path())
                    .ok()
                    .and_then(|c| serde_json::from_str::<LeaseRecord>(&c).ok())
                    .is_some_and(|r| r.state == LeaseState::Released);
                if !released {
                    names.push(stem.to_string());
                }
            }
        }

        names.sort();
        names.dedup();
        Ok(names)
    }

    fn prune_released(&self, before: DateTime<Utc>) -> Result<Vec<String>, ResourceError> {
        let entries = match fs::read_dir(&self.leases_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ResourceError::Io {
                    name: self.leases_dir.display().to_string(),
                    source,
                });
            }
        };

        let mut pruned = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(record) = fs::read_to_string(&path)
                .ok()
                .and_then(|c| serde_json::from_str::<LeaseRecord>(&c).ok())
            else {
                continue;
            };
            if record.state != LeaseState::Released {
                continue;
            }
            // Malformed timestamps count as the epoch, like everywhere else.
            let created = DateTime::parse_from_rfc3339(&record.created_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_default();
            if created >= before {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(resource = %record.name, "Pruned released lease record");
                    pruned.push(record.name);
                }
                Err(e) => warn!("Failed to prune {}: {}", path.display(), e),
            }
        }
        pruned.sort();
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn name(s: &str) -> ResourceName {
        ResourceName::parse(s).unwrap()
    }

    #[test]
    fn test_lease_and_release() {
        let dir = tempdir().unwrap();
        let backend = FsResourceBackend::new(dir.path());
        let n = name("arc-work-1");

        backend.lease(&n, "arc-1", "work").unwrap();
        assert!(backend.exists(&n).unwrap());
        assert!(backend.is_leased(&n).unwrap());
        assert_eq!(backend.list().unwrap(), vec!["arc-work-1".to_string()]);

        backend.release(&n).unwrap();
        assert!(!backend.exists(&n).unwrap());
        assert!(!backend.is_leased(&n).unwrap());
        assert_eq!(
            backend.lease_info(&n).unwrap().unwrap().state,
            LeaseState::Released
        );
        assert!(backend.list().unwrap().is_empty());
    }

    #[test]
    fn test_release_without_lease_is_ok() {
        let dir = tempdir().unwrap();
        let backend = FsResourceBackend::new(dir.path());
        backend.release(&name("arc-none")).unwrap();
    }

    #[test]
    fn test_release_busy_resource() {
        let dir = tempdir().unwrap();
        let backend = FsResourceBackend::new(dir.path());
        let n = name("arc-busy");
        backend.lease(&n, "arc-1", "work").unwrap();
        fs::write(backend.storage_path(&n).join(BUSY_MARKER), "").unwrap();

        assert!(matches!(backend.release(&n), Err(ResourceError::Busy { .. })));
        assert!(backend.exists(&n).unwrap());
    }

    #[test]
    fn test_release_diverged_then_placeholder() {
        let dir = tempdir().unwrap();
        let backend = FsResourceBackend::new(dir.path());
        let n = name("arc-diverged");
        backend.lease(&n, "arc-1", "mend").unwrap();
        backend.remove_storage(&n).unwrap();

        assert!(matches!(
            backend.release(&n),
            Err(ResourceError::Diverged { .. })
        ));

        backend.create_placeholder(&n).unwrap();
        backend.release(&n).unwrap();
        assert!(!backend.is_leased(&n).unwrap());
    }

    #[test]
    fn test_remove_storage_is_idempotent() {
        let dir = tempdir().unwrap();
        let backend = FsResourceBackend::new(dir.path());
        let n = name("arc-gone");
        backend.remove_storage(&n).unwrap();
        backend.create_placeholder(&n).unwrap();
        backend.remove_storage(&n).unwrap();
        backend.remove_storage(&n).unwrap();
        assert!(!backend.exists(&n).unwrap());
    }

    #[test]
    fn test_list_returns_raw_names() {
        let dir = tempdir().unwrap();
        let backend = FsResourceBackend::new(dir.path());
        fs::create_dir_all(dir.path().join("teams").join("weird name")).unwrap();
        fs::create_dir_all(dir.path().join("leases")).unwrap();
        fs::write(dir.path().join("leases").join("arc-x.json"), "not json").unwrap();

        let names = backend.list().unwrap();
        assert_eq!(names, vec!["arc-x".to_string(), "weird name".to_string()]);
        assert!(backend.lease_info(&name("arc-x")).is_err());
    }

    #[test]
    fn test_release_repairs_unreadable_lease() {
        let dir = tempdir().unwrap();
        let backend = FsResourceBackend::new(dir.path());
        let n = name("arc-work-9");
        backend.create_placeholder(&n).unwrap();
        fs::create_dir_all(dir.path().join("leases")).unwrap();
        fs::write(dir.path().join("leases").join("arc-work-9.json"), "{ truncated").unwrap();
        assert!(backend.is_leased(&n).is_err());

        backend.release(&n).unwrap();

        assert!(!backend.exists(&n).unwrap());
        assert!(!backend.is_leased(&n).unwrap());
        assert_eq!(backend.lease_info(&n).unwrap().unwrap().state, LeaseState::Released);
        assert!(backend.list().unwrap().is_empty());
    }

    #[test]
    fn test_prune_released_keeps_live_and_recent_records() {
        let dir = tempdir().unwrap();
        let backend = FsResourceBackend::new(dir.path());
        let (old, recent, live) = (name("arc-old"), name("arc-recent"), name("arc-live"));
        for n in [&old, &recent, &live] {
            backend.lease(n, "arc-1", "work").unwrap();
        }
        backend.release(&old).unwrap();
        backend.release(&recent).unwrap();

        let mut record = backend.lease_info(&old).unwrap().unwrap();
        record.created_at = "2020-01-01T00:00:00Z".to_string();
        backend.write_lease(&old, &record).unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(1);
        assert_eq!(backend.prune_released(cutoff).unwrap(), vec!["arc-old".to_string()]);

        assert!(backend.lease_info(&old).unwrap().is_none());
        assert!(backend.lease_info(&recent).unwrap().is_some());
        assert!(backend.is_leased(&live).unwrap());
    }
}

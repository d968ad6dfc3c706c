//! On-disk checkpoint store.
//!
//! Layout under the runs directory:
//! - `<id>.json` the checkpoint document
//! - `<id>.lock` advisory lock held while a dispatcher drives the run
//! - `<id>/` artifacts produced by the run's phases
//!
//! Writes go to a uniquely named temp file in the same directory, are fsynced
//! and renamed over the target, so a crash never leaves a truncated checkpoint.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::migrate::migrate;
use super::model::{Checkpoint, RunId, RunStatus};
use crate::errors::CheckpointError;
use crate::phase::PhaseRegistry;

/// Every checkpoint in the store, newest first, plus the files that failed to load.
#[derive(Debug, Default)]
pub struct RunListing {
    pub checkpoints: Vec<Checkpoint>,
    pub corrupt: Vec<CheckpointError>,
}

/// Exclusive hold on a run. Dropping it releases the lock.
#[derive(Debug)]
pub struct RunLease {
    id: RunId,
    file: File,
}

impl RunLease {
    pub fn run_id(&self) -> &RunId {
        &self.id
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(run = %self.id, "Failed to unlock run: {}", e);
        }
    }
}

pub struct CheckpointStore {
    runs_dir: PathBuf,
    registry: PhaseRegistry,
}

impl CheckpointStore {
    pub fn new(runs_dir: impl Into<PathBuf>, registry: &PhaseRegistry) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            registry: registry.clone(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn path_for(&self, id: &RunId) -> PathBuf {
        self.runs_dir.join(format!("{}.json", id))
    }

    pub fn artifact_dir(&self, id: &RunId) -> PathBuf {
        self.runs_dir.join(id.as_str())
    }

    fn lock_path(&self, id: &RunId) -> PathBuf {
        self.runs_dir.join(format!("{}.lock", id))
    }

    pub fn exists(&self, id: &RunId) -> bool {
        self.path_for(id).exists()
    }

    /// Load and migrate a checkpoint.
    pub fn load(&self, id: &RunId) -> Result<Checkpoint, CheckpointError> {
        let path = self.path_for(id);
        self.load_path(&path).map_err(|e| match e {
            CheckpointError::NotFound { path, .. } => CheckpointError::NotFound {
                id: id.to_string(),
                path,
            },
            other => other,
        })
    }

    fn load_path(&self, path: &Path) -> Result<Checkpoint, CheckpointError> {
        let corrupt = |reason: String| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound {
                    id: String::new(),
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(corrupt(e.to_string())),
        };

        let raw: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| corrupt(e.to_string()))?;
        let migrated = migrate(raw, &self.registry);
        serde_json::from_value(migrated).map_err(|e| corrupt(e.to_string()))
    }

    /// Persist a checkpoint atomically.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(&checkpoint.id);
        let write_failed = |source: std::io::Error| CheckpointError::WriteFailed {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.runs_dir).map_err(write_failed)?;
        let json = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| write_failed(std::io::Error::other(e)))?;
        atomic_write(&path, &json).map_err(write_failed)?;
        debug!(run = %checkpoint.id, status = %checkpoint.status, "Checkpoint saved");
        Ok(())
    }

    /// Every checkpoint, newest first. Corrupt files are reported, not skipped silently.
    pub fn list(&self) -> RunListing {
        let mut listing = RunListing::default();
        let Ok(entries) = fs::read_dir(&self.runs_dir) else {
            return listing;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") || !path.is_file() {
                continue;
            }
            match self.load_path(&path) {
                Ok(cp) => listing.checkpoints.push(cp),
                Err(e) => {
                    warn!("Skipping unreadable checkpoint: {}", e);
                    listing.corrupt.push(e);
                }
            }
        }

        listing
            .checkpoints
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        listing
    }

    /// Remove a checkpoint that never started running.
    pub fn discard(&self, id: &RunId) {
        let path = self.path_for(id);
        if let Err(e) = fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(run = %id, "Failed to remove {}: {}", path.display(), e);
        }
    }

    /// Most recently updated checkpoint.
    ///
    /// A corrupt file at least as new as every readable checkpoint is
    /// returned as the error, since it may be the run the caller means.
    pub fn latest(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let listing = self.list();
        let newest = listing.checkpoints.first().map(|cp| cp.updated_at);

        for err in listing.corrupt {
            let CheckpointError::Corrupt { path, .. } = &err else {
                continue;
            };
            let modified = fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from);
            let shadows = match (modified, newest) {
                (Some(modified), Some(newest)) => modified >= newest,
                _ => true,
            };
            if shadows {
                return Err(err);
            }
        }
        Ok(listing.checkpoints.into_iter().next())
    }

    /// Take the exclusive lock for a run.
    pub fn acquire(&self, id: &RunId) -> Result<RunLease, CheckpointError> {
        let path = self.lock_path(id);
        let lock_failed = |source: std::io::Error| CheckpointError::LockFailed {
            id: id.to_string(),
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.runs_dir).map_err(lock_failed)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(lock_failed)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(RunLease {
                id: id.clone(),
                file,
            }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(CheckpointError::ConcurrentRun {
                    other: id.to_string(),
                })
            }
            Err(e) => Err(lock_failed(e)),
        }
    }

    /// Whether another process currently holds the run's lock.
    pub fn is_locked(&self, id: &RunId) -> bool {
        let Ok(file) = File::open(self.lock_path(id)) else {
            return false;
        };
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }

    /// Refuse to start while another in-progress run holds its lock.
    ///
    /// Unlocked in-progress runs crashed and are left for `resume`.
    pub fn ensure_no_concurrent_run(&self, current: &RunId) -> Result<(), CheckpointError> {
        for cp in self.list().checkpoints {
            if &cp.id == current || cp.status != RunStatus::InProgress {
                continue;
            }
            if self.is_locked(&cp.id) {
                return Err(CheckpointError::ConcurrentRun {
                    other: cp.id.to_string(),
                });
            }
            debug!(run = %cp.id, "Found crashed in-progress run");
        }
        Ok(())
    }

    /// Resource names that orphan scans must not touch.
    ///
    /// Includes every resource recorded by an in-progress run that is either
    /// locked or was updated within `max_idle`.
    pub fn active_resources(&self, now: DateTime<Utc>, max_idle: Duration) -> BTreeSet<String> {
        self.list()
            .checkpoints
            .iter()
            .filter(|cp| cp.is_live(now, max_idle) || self.is_locked(&cp.id))
            .flat_map(|cp| cp.resource_names())
            .collect()
    }
}

/// Write to a unique temp file, fsync, then rename over `path`.
fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("checkpoint"),
        uuid::Uuid::new_v4()
    );
    let temp_path = path.with_file_name(&temp_name);

    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result?;

    #[cfg(unix)]
    {
        // Best effort: make the rename durable.
        if let Some(parent) = path.parent()
            && let Ok(dir) = File::open(parent)
        {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arc_config::{ResolvedSettings, RunFlags};
    use crate::checkpoint::model::{CURRENT_SCHEMA_VERSION, PhaseStatus, TerminalStatus};
    use tempfile::tempdir;

    fn new_checkpoint(id: &str) -> Checkpoint {
        Checkpoint::new(
            RunId::parse(id).unwrap(),
            "plan.md",
            &PhaseRegistry::default_arc(),
            RunFlags::default(),
            ResolvedSettings::default(),
        )
    }

    fn store(dir: &Path) -> CheckpointStore {
        CheckpointStore::new(dir.join("runs"), &PhaseRegistry::default_arc())
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let cp = new_checkpoint("arc-1");
        store.save(&cp).unwrap();

        let loaded = store.load(&cp.id).unwrap();
        assert_eq!(loaded, cp);

        // No temp files are left behind
        let leftovers: Vec<_> = fs::read_dir(store.runs_dir())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let err = store.load(&RunId::parse("arc-404").unwrap()).unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound { ref id, .. } if id == "arc-404"));
    }

    #[test]
    fn test_load_garbage_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        fs::create_dir_all(store.runs_dir()).unwrap();
        fs::write(store.runs_dir().join("arc-bad.json"), "{ truncated").unwrap();

        let err = store.load(&RunId::parse("arc-bad").unwrap()).unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));

        let listing = store.list();
        assert!(listing.checkpoints.is_empty());
        assert_eq!(listing.corrupt.len(), 1);
    }

    #[test]
    fn test_load_migrates_legacy_document() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        fs::create_dir_all(store.runs_dir()).unwrap();
        let legacy = serde_json::json!({
            "id": "arc-old",
            "plan_reference": "plan.md",
            "phases": { "forge": { "status": "completed" } },
            "started_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z"
        });
        fs::write(store.runs_dir().join("arc-old.json"), legacy.to_string()).unwrap();

        let cp = store.load(&RunId::parse("arc-old").unwrap()).unwrap();
        assert_eq!(cp.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(cp.phases.len(), 12);
        assert_eq!(cp.record("forge").unwrap().status, PhaseStatus::Completed);
        assert_eq!(cp.record("ship").unwrap().status, PhaseStatus::Pending);
    }

    #[test]
    fn test_list_and_latest_newest_first() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut older = new_checkpoint("arc-1");
        older.updated_at = older.updated_at - chrono::Duration::minutes(5);
        let newer = new_checkpoint("arc-2");
        store.save(&older).unwrap();
        store.save(&newer).unwrap();

        let ids: Vec<_> = store
            .list()
            .checkpoints
            .iter()
            .map(|c| c.id.to_string())
            .collect();
        assert_eq!(ids, vec!["arc-2", "arc-1"]);
        assert_eq!(store.latest().unwrap().unwrap().id.as_str(), "arc-2");
    }

    #[test]
    fn test_latest_refuses_newest_corrupt_checkpoint() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut older = new_checkpoint("arc-1");
        older.updated_at = Utc::now() - chrono::Duration::minutes(5);
        store.save(&older).unwrap();
        fs::write(store.runs_dir().join("arc-9.json"), "{ truncated").unwrap();

        let err = store.latest().unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { ref path, .. } if path.ends_with("arc-9.json")));
    }

    #[test]
    fn test_latest_ignores_older_corrupt_checkpoint() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        fs::create_dir_all(store.runs_dir()).unwrap();
        fs::write(store.runs_dir().join("arc-0.json"), "{ truncated").unwrap();
        let mut newer = new_checkpoint("arc-1");
        newer.updated_at = Utc::now() + chrono::Duration::minutes(5);
        store.save(&newer).unwrap();

        assert_eq!(store.latest().unwrap().unwrap().id.as_str(), "arc-1");
    }

    #[test]
    fn test_latest_empty_store() {
        let dir = tempdir().unwrap();
        assert!(store(dir.path()).latest().unwrap().is_none());
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let id = RunId::parse("arc-1").unwrap();

        let lease = store.acquire(&id).unwrap();
        assert!(store.is_locked(&id));
        assert!(matches!(
            store.acquire(&id),
            Err(CheckpointError::ConcurrentRun { .. })
        ));

        drop(lease);
        assert!(!store.is_locked(&id));
        assert!(store.acquire(&id).is_ok());
    }

    #[test]
    fn test_concurrent_run_detection() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let running = new_checkpoint("arc-1");
        store.save(&running).unwrap();
        let me = RunId::parse("arc-2").unwrap();

        // Crashed run: in progress but unlocked
        assert!(store.ensure_no_concurrent_run(&me).is_ok());

        let _lease = store.acquire(&running.id).unwrap();
        assert!(matches!(
            store.ensure_no_concurrent_run(&me),
            Err(CheckpointError::ConcurrentRun { other }) if other == "arc-1"
        ));
        // A run never conflicts with itself
        assert!(store.ensure_no_concurrent_run(&running.id).is_ok());
    }

    #[test]
    fn test_finished_runs_do_not_conflict() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut done = new_checkpoint("arc-1");
        done.finish(TerminalStatus::Completed, None);
        store.save(&done).unwrap();
        let _lease = store.acquire(&done.id).unwrap();
        assert!(store.ensure_no_concurrent_run(&RunId::parse("arc-2").unwrap()).is_ok());
    }

    #[test]
    fn test_active_resources() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let now = Utc::now();
        let week = Duration::from_secs(7 * 86400);

        let mut live = new_checkpoint("arc-1");
        live.record_mut("work").unwrap().resource_name = Some("arc-work-1".into());
        store.save(&live).unwrap();

        let mut stale = new_checkpoint("arc-2");
        stale.record_mut("work").unwrap().resource_name = Some("arc-work-2".into());
        stale.updated_at = now - chrono::Duration::days(8);
        store.save(&stale).unwrap();

        let active = store.active_resources(now, week);
        assert!(active.contains("arc-work-1"));
        assert!(!active.contains("arc-work-2"));

        let _lease = store.acquire(&stale.id).unwrap();
        assert!(store.active_resources(now, week).contains("arc-work-2"));
    }
}

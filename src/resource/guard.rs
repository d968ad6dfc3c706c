//! Resource cleanup guard.
//!
//! Reclaims leased resources before and after phases, and sweeps orphans left
//! by crashed or abandoned runs. Reclaiming escalates through four strategies,
//! stopping at the first that leaves the resource with no storage and no live
//! lease:
//!
//! 1. `release`, retried with exponential backoff
//! 2. force-remove the backing storage
//! 3. `release` once more
//! 4. recreate placeholder storage, `release`, then remove the placeholder
//!
//! Nothing here returns an error. Every failure is logged as a warning and
//! recorded in the [`CleanupReport`]. Names read from a checkpoint or the
//! backend are validated before use; invalid ones are skipped.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backend::ResourceBackend;
use super::name::ResourceName;
use crate::checkpoint::{Checkpoint, PhaseStatus};

/// Thresholds and retry settings for cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupPolicy {
    pub release_attempts: u32,
    /// Delay before the second release attempt; doubles each retry
    pub release_backoff: Duration,
    /// Orphans younger than this are left alone
    pub crash_recovery_age: Duration,
    /// In-progress runs idle longer than this no longer protect their resources
    pub abandoned_run_age: Duration,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            release_attempts: 3,
            release_backoff: Duration::from_millis(250),
            crash_recovery_age: Duration::from_secs(30 * 60),
            abandoned_run_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// The strategy that reclaimed a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Release,
    ForceRemove,
    ReleaseAfterRemove,
    Placeholder,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::Release => "release",
            Strategy::ForceRemove => "force-remove",
            Strategy::ReleaseAfterRemove => "release-after-remove",
            Strategy::Placeholder => "placeholder",
        };
        f.write_str(s)
    }
}

/// What a cleanup pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub reclaimed: Vec<(ResourceName, Strategy)>,
    /// Resources that survived every strategy
    pub failed: Vec<ResourceName>,
    /// Raw names that failed validation
    pub rejected: Vec<String>,
    /// Protected by a live run
    pub kept_active: Vec<ResourceName>,
    /// Younger than the crash-recovery age
    pub kept_fresh: Vec<ResourceName>,
    /// Dry-run candidates
    pub would_reclaim: Vec<ResourceName>,
    /// Released lease records removed as expired history
    pub pruned: Vec<String>,
    pub warnings: Vec<String>,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.reclaimed.is_empty()
            && self.failed.is_empty()
            && self.rejected.is_empty()
            && self.would_reclaim.is_empty()
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }

    fn validate(&mut self, raw: &str) -> Option<ResourceName> {
        match ResourceName::parse(raw) {
            Ok(name) => Some(name),
            Err(e) => {
                self.warn(format!("Skipping resource: {}", e));
                self.rejected.push(raw.to_string());
                None
            }
        }
    }
}

pub struct CleanupGuard {
    backend: Arc<dyn ResourceBackend>,
    policy: CleanupPolicy,
}

impl CleanupGuard {
    pub fn new(backend: Arc<dyn ResourceBackend>, policy: CleanupPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn backend(&self) -> &Arc<dyn ResourceBackend> {
        &self.backend
    }

    pub fn policy(&self) -> &CleanupPolicy {
        &self.policy
    }

    /// Reclaim every resource recorded by the checkpoint that is not in progress.
    ///
    /// Resources that are already gone are not touched, so repeated calls have
    /// no further effect.
    pub async fn pre_cleanup(&self, checkpoint: &Checkpoint) -> CleanupReport {
        let mut report = CleanupReport::default();

        let mut candidates = BTreeSet::new();
        for (phase, record) in &checkpoint.phases {
            if record.status == PhaseStatus::InProgress {
                continue;
            }
            let Some(raw) = record.resource_name.as_deref() else {
                continue;
            };
            if let Some(name) = report.validate(raw) {
                debug!(phase = %phase, resource = %name, "Cleanup candidate");
                candidates.insert(name);
            }
        }

        for name in candidates {
            if self.needs_cleanup(&name, &mut report) {
                self.reclaim_into(&name, &mut report).await;
            }
        }
        report
    }

    /// Release a phase's resource and confirm it is gone.
    pub async fn post_cleanup(&self, name: &ResourceName) -> CleanupReport {
        let mut report = CleanupReport::default();
        if self.needs_cleanup(name, &mut report) {
            self.reclaim_into(name, &mut report).await;
        }
        report
    }

    /// Reclaim resources under `prefixes` that no live run protects and that
    /// are older than the crash-recovery age, then prune released lease
    /// records older than the abandoned-run age.
    ///
    /// A missing or malformed lease timestamp counts as the Unix epoch.
    pub async fn scan_orphans(
        &self,
        prefixes: &[String],
        active: &BTreeSet<String>,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();

        let raw_names = match self.backend.list() {
            Ok(names) => names,
            Err(e) => {
                report.warn(format!("Failed to list resources: {}", e));
                return report;
            }
        };

        for raw in raw_names {
            let Some(name) = report.validate(&raw) else {
                continue;
            };
            if !name.has_prefix(prefixes) {
                continue;
            }
            if active.contains(name.as_str()) {
                report.kept_active.push(name);
                continue;
            }

            let created = self.created_at(&name);
            let age = (now - created).to_std().unwrap_or(Duration::ZERO);
            if age < self.policy.crash_recovery_age {
                report.kept_fresh.push(name);
                continue;
            }

            if dry_run {
                report.would_reclaim.push(name);
            } else {
                self.reclaim_into(&name, &mut report).await;
            }
        }

        if !dry_run {
            self.prune_history(now, &mut report);
        }
        if !dry_run && !report.reclaimed.is_empty() {
            info!(count = report.reclaimed.len(), "Reclaimed orphaned resources");
        }
        report
    }

    /// Drop released lease records older than the abandoned-run age.
    fn prune_history(&self, now: DateTime<Utc>, report: &mut CleanupReport) {
        let Some(cutoff) = chrono::Duration::from_std(self.policy.abandoned_run_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            return;
        };
        match self.backend.prune_released(cutoff) {
            Ok(pruned) => report.pruned = pruned,
            Err(e) => report.warn(format!("Failed to prune lease history: {}", e)),
        }
    }

    fn created_at(&self, name: &ResourceName) -> DateTime<Utc> {
        self.backend
            .lease_info(name)
            .ok()
            .flatten()
            .and_then(|l| DateTime::parse_from_rfc3339(&l.created_at).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default()
    }

    fn needs_cleanup(&self, name: &ResourceName, report: &mut CleanupReport) -> bool {
        match self.settled(name) {
            Ok(settled) => !settled,
            Err(e) => {
                report.warn(format!("Could not inspect {}: {}", name, e));
                true
            }
        }
    }

    /// No storage and no live lease.
    fn settled(&self, name: &ResourceName) -> Result<bool, crate::errors::ResourceError> {
        Ok(!self.backend.exists(name)? && !self.backend.is_leased(name)?)
    }

    fn settled_quietly(&self, name: &ResourceName) -> bool {
        self.settled(name).unwrap_or(false)
    }

    async fn reclaim_into(&self, name: &ResourceName, report: &mut CleanupReport) {
        match self.reclaim(name, report).await {
            Some(strategy) => {
                debug!(resource = %name, %strategy, "Resource reclaimed");
                report.reclaimed.push((name.clone(), strategy));
            }
            None => {
                report.warn(format!("Failed to reclaim resource {}", name));
                report.failed.push(name.clone());
            }
        }
    }

    async fn reclaim(&self, name: &ResourceName, report: &mut CleanupReport) -> Option<Strategy> {
        // 1. Release with backoff
        let mut delay = self.policy.release_backoff;
        for attempt in 1..=self.policy.release_attempts.max(1) {
            match self.backend.release(name) {
                Ok(()) => break,
                Err(e) => {
                    debug!(resource = %name, attempt, "Release failed: {}", e);
                    if attempt < self.policy.release_attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }
        if self.settled_quietly(name) {
            return Some(Strategy::Release);
        }

        // 2. Force-remove storage
        if let Err(e) = self.backend.remove_storage(name) {
            report.warn(format!("Failed to remove storage of {}: {}", name, e));
        }
        if self.settled_quietly(name) {
            return Some(Strategy::ForceRemove);
        }

        // 3. Release again without storage
        if let Err(e) = self.backend.release(name) {
            debug!(resource = %name, "Release after removal failed: {}", e);
        }
        if self.settled_quietly(name) {
            return Some(Strategy::ReleaseAfterRemove);
        }

        // 4. Placeholder so release recognises the resource again
        let outcome = self
            .backend
            .create_placeholder(name)
            .and_then(|()| self.backend.release(name));
        if let Err(e) = outcome {
            report.warn(format!("Placeholder reset of {} failed: {}", name, e));
        }
        if let Err(e) = self.backend.remove_storage(name) {
            report.warn(format!("Failed to remove placeholder of {}: {}", name, e));
        }
        if self.settled_quietly(name) {
            return Some(Strategy::Placeholder);
        }
        None
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::errors::ResourceError;
    use crate::resource::backend::LeaseRecord;
    use proptest::prelude::*;
    use proptest::strategy::Strategy;
    use std::sync::Mutex;

    /// Backend that lists fixed raw names and records every name it is handed.
    struct ListingBackend {
        listed: Vec<String>,
        seen: Mutex<Vec<String>>,
    }

    impl ListingBackend {
        fn saw(&self, name: &ResourceName) {
            self.seen.lock().unwrap().push(name.to_string());
        }
    }

    impl ResourceBackend for ListingBackend {
        fn exists(&self, name: &ResourceName) -> Result<bool, ResourceError> {
            self.saw(name);
            Ok(false)
        }
        fn lease(&self, name: &ResourceName, _: &str, _: &str) -> Result<(), ResourceError> {
            self.saw(name);
            Ok(())
        }
        fn lease_info(&self, name: &ResourceName) -> Result<Option<LeaseRecord>, ResourceError> {
            self.saw(name);
            Ok(None)
        }
        fn release(&self, name: &ResourceName) -> Result<(), ResourceError> {
            self.saw(name);
            Ok(())
        }
        fn remove_storage(&self, name: &ResourceName) -> Result<(), ResourceError> {
            self.saw(name);
            Ok(())
        }
        fn create_placeholder(&self, name: &ResourceName) -> Result<(), ResourceError> {
            self.saw(name);
            Ok(())
        }
        fn list(&self) -> Result<Vec<String>, ResourceError> {
            Ok(self.listed.clone())
        }
    }

    fn adversarial_name() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("../../etc".to_string()),
            Just("; rm -rf /".to_string()),
            Just("team$(whoami)".to_string()),
            Just("arc-..".to_string()),
            "arc-[a-z]{0,8}[/;$`| .][a-z]{0,8}",
            any::<String>(),
        ]
    }

    proptest! {
        /// Hostile names listed by the backend are rejected before any backend call.
        #[test]
        fn hostile_names_never_reach_the_backend(
            names in prop::collection::vec(adversarial_name(), 1..8)
        ) {
            let backend = Arc::new(ListingBackend {
                listed: names.clone(),
                seen: Mutex::new(Vec::new()),
            });
            let guard = CleanupGuard::new(backend.clone(), CleanupPolicy {
                release_backoff: Duration::ZERO,
                ..CleanupPolicy::default()
            });

            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(guard.scan_orphans(&["".to_string()], &BTreeSet::new(), Utc::now(), false));

            for seen in backend.seen.lock().unwrap().iter() {
                prop_assert!(ResourceName::parse(seen).is_ok());
            }
            for raw in &names {
                if ResourceName::parse(raw).is_err() {
                    prop_assert!(!backend.seen.lock().unwrap().contains(raw));
                }
            }
        }
    }
}

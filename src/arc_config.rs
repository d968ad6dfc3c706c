//! Layered configuration for arc.
//!
//! Settings are merged from three typed layers in a fixed order, each one
//! overriding the previous:
//! 1. Built-in defaults
//! 2. `.arc/arc.toml` (with `ARC_*` environment overrides applied on top)
//! 3. CLI flags
//!
//! Everything is validated once at load time. Out-of-range timeouts are kept
//! as written and clamped by the budget calculator; `validate` reports them.
//!
//! # Configuration File Format
//!
//! ```toml
//! [defaults]
//! tier = "standard"
//! approve = false
//! draft = false
//!
//! [timeouts]
//! work = 2400000
//! code_review = 900000
//!
//! [budget]
//! hard_cap_ms = 14400000
//! retry_cycle_ms = 1140000
//!
//! [convergence]
//! finding_threshold = 0
//!
//! [convergence.tiers.thorough]
//! min_cycles = 2
//! max_cycles = 5
//!
//! [cleanup]
//! crash_recovery_mins = 30
//! abandoned_run_days = 7
//! release_attempts = 3
//! release_backoff_ms = 250
//! resource_prefixes = ["arc-"]
//!
//! [phases.work]
//! command = "./scripts/work.sh"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::budget::{DEFAULT_HARD_CAP, MAX_PHASE_TIMEOUT, MIN_PHASE_TIMEOUT};
use crate::convergence::{TierName, TierTable};
use crate::phase::{PhaseRegistry, PhaseToggle};
use crate::resource::CleanupPolicy;

pub const CONFIG_FILE: &str = "arc.toml";

/// Defaults applied to every run unless a CLI flag says otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsSection {
    /// Convergence tier to use instead of classification
    #[serde(default)]
    pub tier: Option<TierName>,
    /// Ask for approval before phases that require it
    #[serde(default)]
    pub approve: bool,
    /// Draft mode is passed through to phases
    #[serde(default)]
    pub draft: bool,
    /// Where resource storage lives (default: `.arc/teams`)
    #[serde(default)]
    pub resource_root: Option<PathBuf>,
}

/// Run budget settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSection {
    /// Absolute ceiling for a run, regardless of tier
    #[serde(default = "default_hard_cap_ms")]
    pub hard_cap_ms: u64,
    /// Budget of each retry cycle (defaults to the first cycle's budget)
    #[serde(default)]
    pub retry_cycle_ms: Option<u64>,
}

fn default_hard_cap_ms() -> u64 {
    DEFAULT_HARD_CAP.as_millis() as u64
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            hard_cap_ms: default_hard_cap_ms(),
            retry_cycle_ms: None,
        }
    }
}

/// Convergence loop settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvergenceSection {
    /// Findings at or below this count are accepted
    #[serde(default)]
    pub finding_threshold: u32,
    #[serde(default)]
    pub tiers: TierTable,
}

/// Resource cleanup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupSection {
    #[serde(default = "default_crash_recovery_mins")]
    pub crash_recovery_mins: u64,
    #[serde(default = "default_abandoned_run_days")]
    pub abandoned_run_days: u64,
    #[serde(default = "default_release_attempts")]
    pub release_attempts: u32,
    #[serde(default = "default_release_backoff_ms")]
    pub release_backoff_ms: u64,
    /// Only resources with one of these prefixes are considered by orphan scans
    #[serde(default = "default_resource_prefixes")]
    pub resource_prefixes: Vec<String>,
}

fn default_crash_recovery_mins() -> u64 {
    30
}

/// Cleanup ages beyond this many days are flagged by `validate`.
const MAX_CLEANUP_AGE_DAYS: u64 = 3650;

fn default_abandoned_run_days() -> u64 {
    7
}

fn default_release_attempts() -> u32 {
    3
}

fn default_release_backoff_ms() -> u64 {
    250
}

fn default_resource_prefixes() -> Vec<String> {
    vec!["arc-".to_string()]
}

impl Default for CleanupSection {
    fn default() -> Self {
        Self {
            crash_recovery_mins: default_crash_recovery_mins(),
            abandoned_run_days: default_abandoned_run_days(),
            release_attempts: default_release_attempts(),
            release_backoff_ms: default_release_backoff_ms(),
            resource_prefixes: default_resource_prefixes(),
        }
    }
}

impl CleanupSection {
    pub fn policy(&self) -> CleanupPolicy {
        CleanupPolicy {
            release_attempts: self.release_attempts.max(1),
            release_backoff: Duration::from_millis(self.release_backoff_ms),
            crash_recovery_age: Duration::from_secs(self.crash_recovery_mins.saturating_mul(60)),
            abandoned_run_age: Duration::from_secs(
                self.abandoned_run_days.saturating_mul(24 * 60 * 60),
            ),
        }
    }
}

/// Per-phase executor settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseCommandSection {
    /// Shell command run for the phase
    #[serde(default)]
    pub command: Option<String>,
}

/// The complete arc.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArcToml {
    #[serde(default)]
    pub defaults: DefaultsSection,
    /// Per-phase timeout overrides in milliseconds
    #[serde(default)]
    pub timeouts: BTreeMap<String, i64>,
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub convergence: ConvergenceSection,
    #[serde(default)]
    pub cleanup: CleanupSection,
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseCommandSection>,
}

impl ArcToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse arc.toml")
    }

    /// Load `.arc/arc.toml`, or defaults when the file doesn't exist.
    pub fn load_or_default(arc_dir: &Path) -> Result<Self> {
        let config_path = arc_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize arc.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `ARC_*` environment overrides from `lookup`.
    ///
    /// - `ARC_HARD_CAP_MS`: run budget ceiling
    /// - `ARC_RESOURCE_ROOT`: resource storage directory
    /// - `ARC_TIER`: default convergence tier
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("ARC_HARD_CAP_MS") {
            self.budget.hard_cap_ms = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid ARC_HARD_CAP_MS '{}'", raw))?;
        }
        if let Some(root) = lookup("ARC_RESOURCE_ROOT") {
            self.defaults.resource_root = Some(PathBuf::from(root));
        }
        if let Some(raw) = lookup("ARC_TIER") {
            self.defaults.tier = Some(raw.parse()?);
        }
        Ok(self)
    }

    /// Command configured for a phase.
    pub fn command_for(&self, phase: &str) -> Option<&str> {
        self.phases.get(phase).and_then(|p| p.command.as_deref())
    }

    pub fn commands(&self) -> BTreeMap<String, String> {
        self.phases
            .iter()
            .filter_map(|(name, p)| p.command.clone().map(|c| (name.clone(), c)))
            .collect()
    }

    /// Merge CLI flags over the file defaults.
    pub fn merge_flags(&self, cli: &RunFlags) -> RunFlags {
        RunFlags {
            no_forge: cli.no_forge,
            no_test: cli.no_test,
            no_ship: cli.no_ship,
            approve: cli.approve || self.defaults.approve,
            draft: cli.draft || self.defaults.draft,
            tier: cli.tier.or(self.defaults.tier),
        }
    }

    /// Snapshot of the settings a run is started with.
    pub fn resolve(&self) -> ResolvedSettings {
        ResolvedSettings {
            timeout_overrides_ms: self.timeouts.clone(),
            hard_cap_ms: self.budget.hard_cap_ms,
            retry_cycle_ms: self.budget.retry_cycle_ms,
            finding_threshold: self.convergence.finding_threshold,
            tiers: self.convergence.tiers.clone(),
        }
    }

    /// Validate the configuration against a registry and return any warnings.
    pub fn validate(&self, registry: &PhaseRegistry) -> Vec<String> {
        let mut warnings = Vec::new();

        let min = MIN_PHASE_TIMEOUT.as_millis() as i64;
        let max = MAX_PHASE_TIMEOUT.as_millis() as i64;
        for (phase, ms) in &self.timeouts {
            if registry.get(phase).is_none() {
                warnings.push(format!("Timeout override for unknown phase '{}'", phase));
            }
            if *ms < min || *ms > max {
                warnings.push(format!(
                    "Timeout {}ms for '{}' is outside [{}ms, {}ms] and will be clamped",
                    ms, phase, min, max
                ));
            }
        }

        for phase in self.phases.keys() {
            if registry.get(phase).is_none() {
                warnings.push(format!("Command configured for unknown phase '{}'", phase));
            }
        }

        if self.budget.hard_cap_ms < MIN_PHASE_TIMEOUT.as_millis() as u64 {
            warnings.push(format!(
                "hard_cap_ms {} is below the minimum and will be raised",
                self.budget.hard_cap_ms
            ));
        }

        if self.cleanup.crash_recovery_mins > MAX_CLEANUP_AGE_DAYS * 24 * 60 {
            warnings.push(format!(
                "crash_recovery_mins {} is unreasonably large; crashed resources will never be reclaimed",
                self.cleanup.crash_recovery_mins
            ));
        }
        if self.cleanup.abandoned_run_days > MAX_CLEANUP_AGE_DAYS {
            warnings.push(format!(
                "abandoned_run_days {} is unreasonably large; abandoned runs will never be reclaimed",
                self.cleanup.abandoned_run_days
            ));
        }

        if self.cleanup.release_attempts == 0 {
            warnings.push("release_attempts = 0; 1 attempt will be made".to_string());
        }

        for prefix in &self.cleanup.resource_prefixes {
            if crate::resource::ResourceName::parse(prefix).is_err() {
                warnings.push(format!("Resource prefix '{}' is not a safe name", prefix));
            }
        }

        warnings.extend(self.convergence.tiers.validate());
        warnings
    }
}

/// Boolean feature flags for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFlags {
    #[serde(default)]
    pub no_forge: bool,
    #[serde(default)]
    pub no_test: bool,
    #[serde(default)]
    pub no_ship: bool,
    #[serde(default)]
    pub approve: bool,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub tier: Option<TierName>,
}

impl RunFlags {
    /// Whether a phase with this toggle is switched off.
    pub fn disables(&self, toggle: Option<PhaseToggle>) -> bool {
        match toggle {
            Some(PhaseToggle::Forge) => self.no_forge,
            Some(PhaseToggle::Test) => self.no_test,
            Some(PhaseToggle::Ship) => self.no_ship,
            None => false,
        }
    }
}

/// Settings persisted with a checkpoint so a resumed run uses the same policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSettings {
    #[serde(default)]
    pub timeout_overrides_ms: BTreeMap<String, i64>,
    #[serde(default = "default_hard_cap_ms")]
    pub hard_cap_ms: u64,
    #[serde(default)]
    pub retry_cycle_ms: Option<u64>,
    #[serde(default)]
    pub finding_threshold: u32,
    #[serde(default)]
    pub tiers: TierTable,
}

impl Default for ResolvedSettings {
    fn default() -> Self {
        ArcToml::default().resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_arc_toml_parse_empty() {
        let toml = ArcToml::parse("").unwrap();
        assert!(toml.timeouts.is_empty());
        assert_eq!(toml.budget.hard_cap_ms, 4 * 60 * 60 * 1000);
        assert_eq!(toml.cleanup.crash_recovery_mins, 30);
        assert_eq!(toml.cleanup.abandoned_run_days, 7);
        assert_eq!(toml.cleanup.resource_prefixes, vec!["arc-".to_string()]);
        assert_eq!(toml.convergence.tiers, TierTable::default());
    }

    #[test]
    fn test_arc_toml_parse_full() {
        let content = r#"
[defaults]
tier = "thorough"
approve = true

[timeouts]
work = 1200000
ship = -5

[budget]
hard_cap_ms = 3600000
retry_cycle_ms = 600000

[convergence]
finding_threshold = 2

[convergence.tiers.light]
min_cycles = 1
max_cycles = 1

[cleanup]
release_attempts = 5
resource_prefixes = ["arc-", "rune-"]

[phases.work]
command = "make work"
"#;
        let toml = ArcToml::parse(content).unwrap();
        assert_eq!(toml.defaults.tier, Some(TierName::Thorough));
        assert!(toml.defaults.approve);
        assert_eq!(toml.timeouts.get("work"), Some(&1_200_000));
        assert_eq!(toml.timeouts.get("ship"), Some(&-5));
        assert_eq!(toml.budget.retry_cycle_ms, Some(600_000));
        assert_eq!(toml.convergence.finding_threshold, 2);
        assert_eq!(toml.convergence.tiers.light.max_cycles, 1);
        // Unspecified tiers keep their defaults
        assert_eq!(toml.convergence.tiers.thorough.max_cycles, 5);
        assert_eq!(toml.cleanup.release_attempts, 5);
        assert_eq!(toml.command_for("work"), Some("make work"));
        assert_eq!(toml.command_for("ship"), None);
    }

    #[test]
    fn test_parse_invalid_toml_fails() {
        assert!(ArcToml::parse("[budget\nhard_cap_ms = ").is_err());
    }

    #[test]
    fn test_merge_flags_precedence() {
        let mut toml = ArcToml::default();
        toml.defaults.tier = Some(TierName::Light);
        toml.defaults.draft = true;

        let cli = RunFlags {
            no_test: true,
            tier: Some(TierName::Thorough),
            ..RunFlags::default()
        };
        let merged = toml.merge_flags(&cli);
        assert!(merged.no_test);
        assert!(merged.draft);
        assert_eq!(merged.tier, Some(TierName::Thorough));

        let merged = toml.merge_flags(&RunFlags::default());
        assert_eq!(merged.tier, Some(TierName::Light));
    }

    #[test]
    fn test_env_overrides() {
        let lookup = |key: &str| match key {
            "ARC_HARD_CAP_MS" => Some("60000".to_string()),
            "ARC_RESOURCE_ROOT" => Some("/tmp/teams".to_string()),
            "ARC_TIER" => Some("light".to_string()),
            _ => None,
        };
        let toml = ArcToml::default().with_env_overrides(lookup).unwrap();
        assert_eq!(toml.budget.hard_cap_ms, 60_000);
        assert_eq!(toml.defaults.resource_root, Some(PathBuf::from("/tmp/teams")));
        assert_eq!(toml.defaults.tier, Some(TierName::Light));
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let lookup = |key: &str| (key == "ARC_HARD_CAP_MS").then(|| "lots".to_string());
        assert!(ArcToml::default().with_env_overrides(lookup).is_err());
    }

    #[test]
    fn test_validate_reports_problems() {
        let registry = PhaseRegistry::default_arc();
        let mut toml = ArcToml::default();
        toml.timeouts.insert("work".into(), 0);
        toml.timeouts.insert("ghost".into(), 60_000);
        toml.phases.insert(
            "phantom".into(),
            PhaseCommandSection {
                command: Some("true".into()),
            },
        );
        toml.cleanup.resource_prefixes.push("../bad".into());

        let warnings = toml.validate(&registry);
        assert!(warnings.iter().any(|w| w.contains("will be clamped")));
        assert!(warnings.iter().any(|w| w.contains("unknown phase 'ghost'")));
        assert!(warnings.iter().any(|w| w.contains("unknown phase 'phantom'")));
        assert!(warnings.iter().any(|w| w.contains("'../bad'")));
    }

    #[test]
    fn test_validate_default_is_clean() {
        let registry = PhaseRegistry::default_arc();
        assert!(ArcToml::default().validate(&registry).is_empty());
    }

    #[test]
    fn test_load_or_default_and_save() {
        let dir = tempdir().unwrap();
        let toml = ArcToml::load_or_default(dir.path()).unwrap();
        assert!(toml.phases.is_empty());

        let mut toml = ArcToml::default();
        toml.timeouts.insert("work".into(), 900_000);
        toml.save(&dir.path().join(CONFIG_FILE)).unwrap();

        let loaded = ArcToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.timeouts.get("work"), Some(&900_000));
    }

    #[test]
    fn test_run_flags_disables() {
        let flags = RunFlags {
            no_forge: true,
            ..RunFlags::default()
        };
        assert!(flags.disables(Some(PhaseToggle::Forge)));
        assert!(!flags.disables(Some(PhaseToggle::Ship)));
        assert!(!flags.disables(None));
    }

    #[test]
    fn test_cleanup_policy_conversion() {
        let section = CleanupSection {
            release_attempts: 0,
            ..CleanupSection::default()
        };
        let policy = section.policy();
        assert_eq!(policy.release_attempts, 1);
        assert_eq!(policy.crash_recovery_age, Duration::from_secs(1800));
        assert_eq!(policy.abandoned_run_age, Duration::from_secs(7 * 86400));
    }

    #[test]
    fn test_cleanup_policy_saturates_huge_ages() {
        let toml = ArcToml::parse(
            "[cleanup]\ncrash_recovery_mins = 9223372036854775807\nabandoned_run_days = 9223372036854775807\n",
        )
        .unwrap();
        let policy = toml.cleanup.policy();
        assert_eq!(policy.crash_recovery_age, Duration::from_secs(u64::MAX));
        assert_eq!(policy.abandoned_run_age, Duration::from_secs(u64::MAX));

        let warnings = toml.validate(&PhaseRegistry::default_arc());
        assert!(warnings.iter().any(|w| w.contains("crash_recovery_mins")));
        assert!(warnings.iter().any(|w| w.contains("abandoned_run_days")));
    }
}

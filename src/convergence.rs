//! Bounded review→fix convergence loop.
//!
//! After each fix cycle the controller compares the number of outstanding
//! findings before and after the cycle:
//!
//! 1. Findings at or below the acceptance threshold: converged
//! 2. Findings increased: halted (divergence), regardless of remaining budget
//! 3. Cycle budget exhausted: halted (circuit breaker)
//! 4. Otherwise: retry the review range
//!
//! Convergence is advisory. A halted loop annotates the run with a warning
//! and the pipeline moves on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named tier, ordered from least to most review effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierName {
    Light,
    Standard,
    Thorough,
}

impl std::fmt::Display for TierName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierName::Light => write!(f, "light"),
            TierName::Standard => write!(f, "standard"),
            TierName::Thorough => write!(f, "thorough"),
        }
    }
}

impl std::str::FromStr for TierName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "light" => Ok(TierName::Light),
            "standard" => Ok(TierName::Standard),
            "thorough" => Ok(TierName::Thorough),
            _ => anyhow::bail!(
                "Invalid tier '{}'. Valid values: light, standard, thorough",
                s
            ),
        }
    }
}

/// Cycle bounds for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBounds {
    pub min_cycles: u32,
    pub max_cycles: u32,
}

impl TierBounds {
    pub const fn new(min_cycles: u32, max_cycles: u32) -> Self {
        Self {
            min_cycles,
            max_cycles,
        }
    }
}

/// Cycle bounds for every tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTable {
    #[serde(default = "default_light")]
    pub light: TierBounds,
    #[serde(default = "default_standard")]
    pub standard: TierBounds,
    #[serde(default = "default_thorough")]
    pub thorough: TierBounds,
}

fn default_light() -> TierBounds {
    TierBounds::new(1, 2)
}

fn default_standard() -> TierBounds {
    TierBounds::new(2, 3)
}

fn default_thorough() -> TierBounds {
    TierBounds::new(2, 5)
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            light: default_light(),
            standard: default_standard(),
            thorough: default_thorough(),
        }
    }
}

impl TierTable {
    pub fn bounds(&self, name: TierName) -> TierBounds {
        match name {
            TierName::Light => self.light,
            TierName::Standard => self.standard,
            TierName::Thorough => self.thorough,
        }
    }

    /// Build a tier from this table, clamping `max_cycles` to at least one.
    pub fn tier(&self, name: TierName, justification: impl Into<String>) -> ConvergenceTier {
        let bounds = self.bounds(name);
        let max_cycles = bounds.max_cycles.max(1);
        ConvergenceTier {
            name,
            min_cycles: bounds.min_cycles.min(max_cycles),
            max_cycles,
            justification: justification.into(),
        }
    }

    /// Return a warning per inconsistent tier.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for name in [TierName::Light, TierName::Standard, TierName::Thorough] {
            let b = self.bounds(name);
            if b.max_cycles == 0 {
                warnings.push(format!("Tier '{}' has max_cycles = 0; 1 will be used", name));
            }
            if b.min_cycles > b.max_cycles {
                warnings.push(format!(
                    "Tier '{}' has min_cycles {} > max_cycles {}",
                    name, b.min_cycles, b.max_cycles
                ));
            }
        }
        if self.light.max_cycles > self.standard.max_cycles
            || self.standard.max_cycles > self.thorough.max_cycles
        {
            warnings.push(
                "Tier max_cycles should be ordered light <= standard <= thorough".to_string(),
            );
        }
        warnings
    }
}

/// The tier selected for a run. Persisted once selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceTier {
    pub name: TierName,
    pub min_cycles: u32,
    pub max_cycles: u32,
    /// Why this tier was chosen
    pub justification: String,
}

/// Declared risk of a change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    #[default]
    Low,
    Medium,
    High,
}

impl std::str::FromStr for Risk {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Risk::Low),
            "medium" => Ok(Risk::Medium),
            "high" => Ok(Risk::High),
            _ => anyhow::bail!("Invalid risk '{}'. Valid values: low, medium, high", s),
        }
    }
}

/// Inputs to tier selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeProfile {
    pub files_changed: u32,
    pub lines_changed: u32,
    pub risk: Risk,
}

/// Picks a tier from the size and risk of a change.
pub struct TierSelector {
    table: TierTable,
}

impl TierSelector {
    pub fn new(table: TierTable) -> Self {
        Self { table }
    }

    /// Classify a change.
    ///
    /// High risk or a large diff selects `thorough`; a small, low-risk diff
    /// selects `light`; everything else is `standard`.
    pub fn select(&self, profile: &ChangeProfile) -> ConvergenceTier {
        if profile.risk == Risk::High {
            return self.table.tier(TierName::Thorough, "declared high risk");
        }
        if profile.files_changed >= 20 || profile.lines_changed >= 1000 {
            return self.table.tier(
                TierName::Thorough,
                format!(
                    "large change: {} files, {} lines",
                    profile.files_changed, profile.lines_changed
                ),
            );
        }
        if profile.risk == Risk::Low && profile.files_changed <= 3 && profile.lines_changed <= 100
        {
            return self.table.tier(
                TierName::Light,
                format!(
                    "small low-risk change: {} files, {} lines",
                    profile.files_changed, profile.lines_changed
                ),
            );
        }
        self.table.tier(TierName::Standard, "default classification")
    }

    pub fn explicit(&self, name: TierName) -> ConvergenceTier {
        self.table.tier(name, "explicitly requested")
    }
}

/// Why the loop stopped without converging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// Findings increased relative to the previous round
    Diverged,
    /// The tier's cycle budget is spent
    CircuitBreaker,
    /// The closing phase reported no finding count, so progress is unknown
    Unreported,
}

/// Outcome of evaluating one fix cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "reason")]
pub enum Verdict {
    Converged,
    Retry,
    Halted(HaltReason),
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Converged => write!(f, "converged"),
            Verdict::Retry => write!(f, "retry"),
            Verdict::Halted(HaltReason::Diverged) => write!(f, "halted (diverged)"),
            Verdict::Halted(HaltReason::CircuitBreaker) => write!(f, "halted (circuit breaker)"),
            Verdict::Halted(HaltReason::Unreported) => write!(f, "halted (findings unreported)"),
        }
    }
}

/// Evaluate one completed cycle.
///
/// `round` is the 1-based index of the cycle that just finished.
pub fn evaluate(
    findings_before: u32,
    findings_after: u32,
    round: u32,
    tier: &ConvergenceTier,
    threshold: u32,
) -> Verdict {
    if findings_after <= threshold {
        Verdict::Converged
    } else if findings_after > findings_before {
        Verdict::Halted(HaltReason::Diverged)
    } else if round >= tier.max_cycles {
        Verdict::Halted(HaltReason::CircuitBreaker)
    } else {
        Verdict::Retry
    }
}

/// One evaluated cycle, kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceRound {
    pub round: u32,
    pub findings_before: u32,
    pub findings_after: u32,
    pub verdict: Verdict,
    pub recorded_at: DateTime<Utc>,
}

/// Persisted state of the convergence loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceState {
    /// Current cycle index, 0 until a tier is selected
    #[serde(default)]
    pub round: u32,
    #[serde(default)]
    pub max_rounds: u32,
    #[serde(default)]
    pub tier: Option<ConvergenceTier>,
    #[serde(default)]
    pub history: Vec<ConvergenceRound>,
}

impl ConvergenceState {
    /// Set the tier unless one is already persisted. Returns whether it was set.
    pub fn ensure_tier(&mut self, tier: ConvergenceTier) -> bool {
        if self.tier.is_some() {
            return false;
        }
        self.max_rounds = tier.max_cycles;
        self.round = 1;
        self.tier = Some(tier);
        true
    }

    /// Findings count the next evaluation compares against.
    pub fn baseline(&self, first_review_findings: u32) -> u32 {
        self.history
            .last()
            .map(|r| r.findings_after)
            .unwrap_or(first_review_findings)
    }

    /// Whether the loop already reached a final verdict.
    pub fn is_settled(&self) -> bool {
        self.history
            .last()
            .is_some_and(|r| r.verdict != Verdict::Retry)
    }

    /// Whether the cycle at `self.round` already has a recorded verdict.
    pub fn current_round_evaluated(&self) -> bool {
        self.history.iter().any(|r| r.round == self.round)
    }

    /// Record the cycle at `self.round` as halted because no finding count
    /// came back. The baseline carries over unchanged.
    pub fn halt_unreported(&mut self, before: u32) -> Verdict {
        let verdict = Verdict::Halted(HaltReason::Unreported);
        self.history.push(ConvergenceRound {
            round: self.round,
            findings_before: before,
            findings_after: before,
            verdict,
            recorded_at: Utc::now(),
        });
        verdict
    }

    /// Evaluate the cycle at `self.round`, record it and advance on retry.
    pub fn advance(&mut self, before: u32, after: u32, threshold: u32) -> Verdict {
        let verdict = match &self.tier {
            Some(tier) => evaluate(before, after, self.round, tier, threshold),
            None => Verdict::Halted(HaltReason::CircuitBreaker),
        };
        self.history.push(ConvergenceRound {
            round: self.round,
            findings_before: before,
            findings_after: after,
            verdict,
            recorded_at: Utc::now(),
        });
        if verdict == Verdict::Retry {
            self.round += 1;
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard() -> ConvergenceTier {
        TierTable::default().tier(TierName::Standard, "test")
    }

    #[test]
    fn test_evaluate_converges_when_clean() {
        assert_eq!(evaluate(5, 0, 1, &standard(), 0), Verdict::Converged);
    }

    #[test]
    fn test_evaluate_converges_below_threshold() {
        assert_eq!(evaluate(5, 2, 1, &standard(), 2), Verdict::Converged);
    }

    #[test]
    fn test_evaluate_halts_on_divergence_with_budget_left() {
        assert_eq!(
            evaluate(3, 4, 1, &standard(), 0),
            Verdict::Halted(HaltReason::Diverged)
        );
    }

    #[test]
    fn test_evaluate_retries_when_improving() {
        assert_eq!(evaluate(6, 3, 1, &standard(), 0), Verdict::Retry);
    }

    #[test]
    fn test_evaluate_circuit_breaker_at_max() {
        let tier = standard();
        assert_eq!(
            evaluate(6, 3, tier.max_cycles, &tier, 0),
            Verdict::Halted(HaltReason::CircuitBreaker)
        );
    }

    #[test]
    fn test_state_tier_is_never_reselected() {
        let table = TierTable::default();
        let mut state = ConvergenceState::default();
        assert!(state.ensure_tier(table.tier(TierName::Light, "first")));
        assert!(!state.ensure_tier(table.tier(TierName::Thorough, "stale")));
        assert_eq!(state.tier.as_ref().unwrap().name, TierName::Light);
        assert_eq!(state.max_rounds, 2);
        assert_eq!(state.round, 1);
    }

    #[test]
    fn test_state_advance_records_history() {
        let mut state = ConvergenceState::default();
        state.ensure_tier(standard());
        assert_eq!(state.advance(8, 4, 0), Verdict::Retry);
        assert_eq!(state.round, 2);
        assert_eq!(state.baseline(8), 4);
        assert_eq!(state.advance(4, 0, 0), Verdict::Converged);
        assert_eq!(state.round, 2);
        assert_eq!(state.history.len(), 2);
        assert!(state.is_settled());
    }

    #[test]
    fn test_state_unreported_findings_halt() {
        let mut state = ConvergenceState::default();
        state.ensure_tier(standard());
        let verdict = state.halt_unreported(5);
        assert_eq!(verdict, Verdict::Halted(HaltReason::Unreported));
        assert_eq!(verdict.to_string(), "halted (findings unreported)");
        assert_eq!(state.round, 1);
        assert_eq!(state.baseline(0), 5);
        assert!(state.current_round_evaluated());
        assert!(state.is_settled());
    }

    #[test]
    fn test_selector_classification() {
        let selector = TierSelector::new(TierTable::default());
        let small = ChangeProfile {
            files_changed: 2,
            lines_changed: 40,
            risk: Risk::Low,
        };
        assert_eq!(selector.select(&small).name, TierName::Light);

        let medium = ChangeProfile {
            files_changed: 8,
            lines_changed: 400,
            risk: Risk::Medium,
        };
        assert_eq!(selector.select(&medium).name, TierName::Standard);

        let risky = ChangeProfile {
            files_changed: 1,
            lines_changed: 5,
            risk: Risk::High,
        };
        assert_eq!(selector.select(&risky).name, TierName::Thorough);

        let large = ChangeProfile {
            files_changed: 40,
            lines_changed: 10,
            risk: Risk::Low,
        };
        assert_eq!(selector.select(&large).name, TierName::Thorough);
    }

    #[test]
    fn test_tier_ordering() {
        assert!(TierName::Light < TierName::Standard);
        assert!(TierName::Standard < TierName::Thorough);
        let table = TierTable::default();
        assert!(table.light.max_cycles <= table.standard.max_cycles);
        assert!(table.standard.max_cycles <= table.thorough.max_cycles);
        assert!(table.validate().is_empty());
    }

    #[test]
    fn test_tier_table_validate_flags_inverted_bounds() {
        let table = TierTable {
            light: TierBounds::new(3, 1),
            ..TierTable::default()
        };
        let warnings = table.validate();
        assert!(warnings.iter().any(|w| w.contains("min_cycles 3 > max_cycles 1")));
    }

    #[test]
    fn test_tier_name_from_str() {
        assert_eq!("THOROUGH".parse::<TierName>().unwrap(), TierName::Thorough);
        assert!("extreme".parse::<TierName>().is_err());
    }

    #[test]
    fn test_risk_from_str() {
        assert_eq!("Medium".parse::<Risk>().unwrap(), Risk::Medium);
        assert!("critical".parse::<Risk>().is_err());
    }
}

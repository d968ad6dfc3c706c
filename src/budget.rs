//! Timeout budget calculator.
//!
//! Per-phase timeouts are the real enforcement mechanism: the run-level budget
//! is only checked between phases, so a stuck phase must be bounded by its own
//! timeout. Every configured override is clamped into
//! [`MIN_PHASE_TIMEOUT`, `MAX_PHASE_TIMEOUT`] before use.
//!
//! The run budget is `base + cycle1 + (max_cycles - 1) * cycle_n`, capped at a
//! hard ceiling:
//! - `base` is the sum of every phase outside the convergence range
//! - `cycle1` is the sum of the convergence range
//! - `cycle_n` is the budget of each retry cycle (defaults to `cycle1`)

use std::collections::BTreeMap;
use std::time::Duration;

use crate::arc_config::ResolvedSettings;
use crate::convergence::ConvergenceTier;
use crate::errors::PhaseError;
use crate::phase::PhaseRegistry;

pub const MIN_PHASE_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_PHASE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_HARD_CAP: Duration = Duration::from_secs(4 * 60 * 60);
pub const MAX_HARD_CAP: Duration = Duration::from_secs(24 * 60 * 60);

/// Clamp an untrusted override (milliseconds, possibly negative) to the phase bounds.
pub fn clamp_timeout_ms(raw: i64) -> Duration {
    let min = MIN_PHASE_TIMEOUT.as_millis() as i64;
    let max = MAX_PHASE_TIMEOUT.as_millis() as i64;
    Duration::from_millis(raw.clamp(min, max) as u64)
}

/// Resolve the timeout of `name`: the clamped override if present, else the default.
pub fn timeout_for(
    registry: &PhaseRegistry,
    name: &str,
    overrides: &BTreeMap<String, i64>,
) -> Result<Duration, PhaseError> {
    let phase = registry.require(name)?;
    Ok(match overrides.get(name) {
        Some(raw) => clamp_timeout_ms(*raw),
        None => phase.default_timeout,
    })
}

/// Computes phase timeouts and the run budget for one registry and settings snapshot.
pub struct BudgetCalculator<'a> {
    registry: &'a PhaseRegistry,
    overrides: &'a BTreeMap<String, i64>,
    retry_cycle: Option<Duration>,
    hard_cap: Duration,
}

impl<'a> BudgetCalculator<'a> {
    pub fn new(registry: &'a PhaseRegistry, settings: &'a ResolvedSettings) -> Self {
        let hard_cap = Duration::from_millis(settings.hard_cap_ms)
            .clamp(MIN_PHASE_TIMEOUT, MAX_HARD_CAP);
        Self {
            registry,
            overrides: &settings.timeout_overrides_ms,
            retry_cycle: settings.retry_cycle_ms.map(Duration::from_millis),
            hard_cap,
        }
    }

    pub fn timeout_for(&self, name: &str) -> Result<Duration, PhaseError> {
        timeout_for(self.registry, name, self.overrides)
    }

    fn effective(&self, name: &str) -> Duration {
        // Names come from the registry itself, so the lookup cannot miss.
        self.timeout_for(name).unwrap_or(MIN_PHASE_TIMEOUT)
    }

    /// Sum of every phase outside the convergence range.
    pub fn base_budget(&self) -> Duration {
        self.registry
            .phases()
            .iter()
            .filter(|p| !self.registry.in_convergence_range(&p.name))
            .map(|p| self.effective(&p.name))
            .sum()
    }

    /// Budget of the first review/fix cycle.
    pub fn first_cycle_budget(&self) -> Duration {
        self.registry
            .convergence_range()
            .iter()
            .map(|p| self.effective(&p.name))
            .sum()
    }

    /// Budget of each retry cycle.
    pub fn retry_cycle_budget(&self) -> Duration {
        self.retry_cycle
            .unwrap_or_else(|| self.first_cycle_budget())
    }

    pub fn hard_cap(&self) -> Duration {
        self.hard_cap
    }

    /// Total run budget for a tier, capped at the hard ceiling.
    pub fn total_budget(&self, tier: &ConvergenceTier) -> Duration {
        let retries = tier.max_cycles.saturating_sub(1);
        let uncapped = self.base_budget()
            + self.first_cycle_budget()
            + self.retry_cycle_budget().saturating_mul(retries);
        uncapped.min(self.hard_cap)
    }
}

/// Cumulative time spent inside phases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineClock {
    elapsed: Duration,
}

impl PipelineClock {
    pub fn starting_at(elapsed: Duration) -> Self {
        Self { elapsed }
    }

    pub fn add(&mut self, d: Duration) {
        self.elapsed = self.elapsed.saturating_add(d);
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn exceeded(&self, budget: Duration) -> bool {
        self.elapsed > budget
    }

    pub fn remaining(&self, budget: Duration) -> Duration {
        budget.saturating_sub(self.elapsed)
    }
}

/// Format a duration as `1h 05m`, `12m 30s` or `45s`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {:02}m", h, m)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Any override, however hostile, resolves inside the phase bounds.
        #[test]
        fn clamped_timeout_stays_in_bounds(raw in any::<i64>()) {
            let d = clamp_timeout_ms(raw);
            prop_assert!(d >= MIN_PHASE_TIMEOUT);
            prop_assert!(d <= MAX_PHASE_TIMEOUT);
        }

        #[test]
        fn resolved_timeout_stays_in_bounds(raw in prop_oneof![
            Just(0i64), Just(-1i64), Just(i64::MIN), Just(i64::MAX), any::<i64>()
        ]) {
            let registry = PhaseRegistry::default_arc();
            let mut overrides = BTreeMap::new();
            overrides.insert("work".to_string(), raw);
            let d = timeout_for(&registry, "work", &overrides).unwrap();
            prop_assert!(d >= MIN_PHASE_TIMEOUT && d <= MAX_PHASE_TIMEOUT);
        }
    }
}

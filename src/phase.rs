//! Phase registry for the arc pipeline.
//!
//! This module provides:
//! - `PhaseSpec` describing a single phase: name, timeout, failure class and artifacts
//! - `PhaseRegistry`, the ordered list of phases plus the convergence range
//! - The default arc registry used when no custom registry is supplied
//!
//! A phase is opaque to the core. The registry only knows how long it may run,
//! what happens when it fails, and which artifacts it reads and writes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::PhaseError;

/// How a phase failure affects the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseClass {
    /// Output blocks correctness; any failure halts the run.
    HardGate,
    /// Supplementary diagnostics; failures are recorded and the run continues.
    Advisory,
    /// Part of the review/fix convergence loop.
    BoundedRetry,
}

impl std::fmt::Display for PhaseClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseClass::HardGate => write!(f, "hard-gate"),
            PhaseClass::Advisory => write!(f, "advisory"),
            PhaseClass::BoundedRetry => write!(f, "bounded-retry"),
        }
    }
}

/// Run flags that can switch a phase off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseToggle {
    Forge,
    Test,
    Ship,
}

/// Represents a single pipeline phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSpec {
    /// Phase name, also used in artifact and resource paths
    pub name: String,
    /// Timeout used when no override is configured
    pub default_timeout: Duration,
    /// Failure policy
    pub class: PhaseClass,
    /// Whether the phase leases a concurrent-execution resource
    pub delegated: bool,
    /// Phases whose artifacts are handed to this phase
    pub inputs: Vec<String>,
    /// Artifact file name, relative to the run's artifact directory
    pub output: String,
    /// Flag that disables the phase, if any
    pub toggle: Option<PhaseToggle>,
    /// Whether the phase waits for operator approval when `--approve` is set
    pub requires_approval: bool,
}

impl PhaseSpec {
    /// Create an orchestrator-only phase with no inputs.
    pub fn new(name: &str, default_timeout: Duration, class: PhaseClass, output: &str) -> Self {
        Self {
            name: name.to_string(),
            default_timeout,
            class,
            delegated: false,
            inputs: Vec::new(),
            output: output.to_string(),
            toggle: None,
            requires_approval: false,
        }
    }

    pub fn delegated(mut self) -> Self {
        self.delegated = true;
        self
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_toggle(mut self, toggle: PhaseToggle) -> Self {
        self.toggle = Some(toggle);
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

/// Ordered list of phases plus the sub-sequence re-run by the convergence loop.
#[derive(Debug, Clone)]
pub struct PhaseRegistry {
    phases: Vec<PhaseSpec>,
    convergence: Option<(usize, usize)>,
}

impl PhaseRegistry {
    /// Build a registry, validating names and the convergence range.
    pub fn new(phases: Vec<PhaseSpec>, convergence: Option<(&str, &str)>) -> Result<Self, PhaseError> {
        for (i, phase) in phases.iter().enumerate() {
            if crate::resource::ResourceName::parse(&phase.name).is_err() {
                return Err(PhaseError::InvalidName(phase.name.clone()));
            }
            if phases[..i].iter().any(|p| p.name == phase.name) {
                return Err(PhaseError::DuplicatePhase(phase.name.clone()));
            }
        }

        let mut registry = Self {
            phases,
            convergence: None,
        };

        if let Some((start, end)) = convergence {
            let invalid = || PhaseError::InvalidRange {
                start: start.to_string(),
                end: end.to_string(),
            };
            let s = registry.position(start).ok_or_else(invalid)?;
            let e = registry.position(end).ok_or_else(invalid)?;
            if s > e {
                return Err(invalid());
            }
            registry.convergence = Some((s, e));
        }

        Ok(registry)
    }

    /// The default arc pipeline.
    pub fn default_arc() -> Self {
        let mins = |m: u64| Duration::from_secs(m * 60);
        let phases = vec![
            PhaseSpec::new("forge", mins(15), PhaseClass::Advisory, "enriched-plan.md")
                .delegated()
                .with_toggle(PhaseToggle::Forge),
            PhaseSpec::new("plan_review", mins(15), PhaseClass::HardGate, "plan-review.md")
                .delegated()
                .with_inputs(&["forge"]),
            PhaseSpec::new("plan_refine", mins(3), PhaseClass::Advisory, "concern-context.md")
                .with_inputs(&["plan_review"]),
            PhaseSpec::new(
                "verification",
                Duration::from_secs(30),
                PhaseClass::HardGate,
                "verification-report.md",
            )
            .with_inputs(&["forge", "plan_refine"]),
            PhaseSpec::new("work", mins(35), PhaseClass::HardGate, "work-summary.md")
                .delegated()
                .with_inputs(&["forge", "plan_refine"])
                .with_approval(),
            PhaseSpec::new("gap_analysis", mins(12), PhaseClass::Advisory, "gap-analysis.md")
                .with_inputs(&["work"]),
            PhaseSpec::new("code_review", mins(15), PhaseClass::BoundedRetry, "tome.md")
                .delegated()
                .with_inputs(&["work", "gap_analysis"]),
            PhaseSpec::new("mend", mins(23), PhaseClass::BoundedRetry, "resolution-report.md")
                .delegated()
                .with_inputs(&["code_review"]),
            PhaseSpec::new("verify_mend", mins(4), PhaseClass::BoundedRetry, "verify-mend.md")
                .with_inputs(&["mend"]),
            PhaseSpec::new("test", mins(15), PhaseClass::Advisory, "test-report.md")
                .delegated()
                .with_inputs(&["work"])
                .with_toggle(PhaseToggle::Test),
            PhaseSpec::new("audit", mins(20), PhaseClass::Advisory, "audit-report.md")
                .delegated()
                .with_inputs(&["work", "verify_mend"]),
            PhaseSpec::new("ship", mins(5), PhaseClass::HardGate, "ship-report.md")
                .with_inputs(&["audit"])
                .with_toggle(PhaseToggle::Ship),
        ];

        // The table above is static and satisfies every registry check.
        Self {
            phases,
            convergence: Some((6, 8)),
        }
    }

    /// All phases in execution order.
    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.phases.iter().map(|p| p.name.as_str()).collect()
    }

    /// Get a phase by name.
    pub fn get(&self, name: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn require(&self, name: &str) -> Result<&PhaseSpec, PhaseError> {
        self.get(name)
            .ok_or_else(|| PhaseError::UnknownPhase(name.to_string()))
    }

    /// Index of a phase in execution order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    /// Index bounds (inclusive) of the convergence range.
    pub fn convergence_bounds(&self) -> Option<(usize, usize)> {
        self.convergence
    }

    /// Phases re-run by each convergence retry.
    pub fn convergence_range(&self) -> &[PhaseSpec] {
        match self.convergence {
            Some((s, e)) => &self.phases[s..=e],
            None => &[],
        }
    }

    pub fn in_convergence_range(&self, name: &str) -> bool {
        self.convergence_range().iter().any(|p| p.name == name)
    }

    /// Whether `name` is the last phase of the convergence range.
    pub fn closes_convergence_cycle(&self, name: &str) -> bool {
        self.convergence
            .is_some_and(|(_, e)| self.phases[e].name == name)
    }
}

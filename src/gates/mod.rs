use anyhow::Result;
use dialoguer::{Select, theme::ColorfulTheme};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::budget::format_duration;
use crate::phase::PhaseSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Approved,
    /// Skip this phase (hard gates fail instead)
    Rejected,
    /// Stop the run, leaving it resumable
    Aborted,
}

/// Decides whether a phase that requires approval may run.
pub trait PhaseApprover: Send + Sync {
    fn approve(&self, phase: &PhaseSpec) -> Result<GateDecision>;
}

/// Approves everything. Used when `--approve` is not set and in tests.
pub struct AutoApprove;

impl PhaseApprover for AutoApprove {
    fn approve(&self, _phase: &PhaseSpec) -> Result<GateDecision> {
        Ok(GateDecision::Approved)
    }
}

/// Interactive approval prompt.
pub struct ApprovalGate {
    skip_all: AtomicBool,
}

impl ApprovalGate {
    pub fn new(skip_all: bool) -> Self {
        Self {
            skip_all: AtomicBool::new(skip_all),
        }
    }

    fn prompt_user(&self) -> Result<GateDecision> {
        let options = &[
            "Yes, run this phase",
            "Yes, and approve remaining phases (--yes)",
            "Skip this phase",
            "Abort run",
        ];

        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Proceed with this phase?")
            .items(options)
            .default(0)
            .interact()?;

        Ok(match selection {
            0 => GateDecision::Approved,
            1 => {
                self.skip_all.store(true, Ordering::SeqCst);
                GateDecision::Approved
            }
            2 => GateDecision::Rejected,
            _ => GateDecision::Aborted,
        })
    }
}

impl PhaseApprover for ApprovalGate {
    fn approve(&self, phase: &PhaseSpec) -> Result<GateDecision> {
        println!();
        println!(
            "{} {} ({}, timeout {})",
            console::style("Approval required:").bold(),
            console::style(&phase.name).yellow(),
            phase.class,
            format_duration(phase.default_timeout)
        );

        if self.skip_all.load(Ordering::SeqCst) {
            println!("  {} (--yes flag)", console::style("Auto-approved").dim());
            return Ok(GateDecision::Approved);
        }

        self.prompt_user()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseRegistry;

    #[test]
    fn test_auto_approve() {
        let registry = PhaseRegistry::default_arc();
        let work = registry.get("work").unwrap();
        assert_eq!(AutoApprove.approve(work).unwrap(), GateDecision::Approved);
    }

    #[test]
    fn test_gate_with_yes_flag_never_prompts() {
        let registry = PhaseRegistry::default_arc();
        let gate = ApprovalGate::new(true);
        let work = registry.get("work").unwrap();
        assert_eq!(gate.approve(work).unwrap(), GateDecision::Approved);
    }
}

//! The dispatcher loop.
//!
//! Drives a checkpoint through the registry in order, one phase at a time.
//! State is persisted after every transition, so a crash always leaves the
//! checkpoint clearly before or clearly after a phase.
//!
//! Per phase:
//! 1. skip phases already completed or skipped, or switched off by a flag
//! 2. check the run budget (only between phases, never during one); an
//!    overrun by the final phase is recorded as a warning on completion
//! 3. ask for approval when required
//! 4. pre-cleanup, then lease a resource for delegated phases
//! 5. mark `in_progress`, persist, invoke under the phase timeout
//! 6. post-cleanup, hash the artifact, record the outcome and persist
//! 7. apply the failure class, and after the last phase of the convergence
//!    range ask the convergence controller whether to loop back

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::budget::{BudgetCalculator, PipelineClock, format_duration};
use crate::checkpoint::{
    Checkpoint, CheckpointStore, PhaseStatus, RunStatus, TerminalStatus, hash_file,
    verify_completed,
};
use crate::convergence::{TierName, Verdict};
use crate::errors::OrchestratorError;
use crate::gates::{AutoApprove, GateDecision, PhaseApprover};
use crate::orchestrator::invoker::{OutcomeStatus, PhaseInvocation, PhaseInvoker, PhaseOutcome};
use crate::phase::{PhaseClass, PhaseRegistry, PhaseSpec};
use crate::resource::{CleanupGuard, ResourceName};
use crate::ui::PipelineUI;

/// What the loop does after a phase.
enum Next {
    Advance,
    Halt(TerminalStatus),
}

pub struct Dispatcher {
    registry: PhaseRegistry,
    store: CheckpointStore,
    guard: CleanupGuard,
    invoker: Arc<dyn PhaseInvoker>,
    approver: Arc<dyn PhaseApprover>,
    ui: Option<Arc<PipelineUI>>,
}

impl Dispatcher {
    pub fn new(
        registry: PhaseRegistry,
        store: CheckpointStore,
        guard: CleanupGuard,
        invoker: Arc<dyn PhaseInvoker>,
    ) -> Self {
        Self {
            registry,
            store,
            guard,
            invoker,
            approver: Arc::new(AutoApprove),
            ui: None,
        }
    }

    pub fn with_approver(mut self, approver: Arc<dyn PhaseApprover>) -> Self {
        self.approver = approver;
        self
    }

    pub fn with_ui(mut self, ui: Arc<PipelineUI>) -> Self {
        self.ui = Some(ui);
        self
    }

    pub fn registry(&self) -> &PhaseRegistry {
        &self.registry
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Reopen a failed or timed-out run and continue it.
    pub async fn resume(&self, checkpoint: &mut Checkpoint) -> Result<TerminalStatus, OrchestratorError> {
        if matches!(checkpoint.status, RunStatus::Failed | RunStatus::Timeout) {
            info!(run = %checkpoint.id, previous = %checkpoint.status, "Reopening run");
            checkpoint.reopen();
        }
        self.run(checkpoint).await
    }

    /// Drive the checkpoint to a terminal status.
    ///
    /// A checkpoint that is already terminal is returned unchanged.
    pub async fn run(&self, checkpoint: &mut Checkpoint) -> Result<TerminalStatus, OrchestratorError> {
        if let Some(status) = checkpoint.status.terminal() {
            debug!(run = %checkpoint.id, %status, "Run already finished");
            return Ok(status);
        }

        let _lease = self.store.acquire(&checkpoint.id)?;
        // A fresh run must be on disk before the check so that a run starting
        // at the same moment sees it.
        let fresh = !self.store.exists(&checkpoint.id);
        if fresh {
            self.save(checkpoint)?;
        }
        if let Err(e) = self.store.ensure_no_concurrent_run(&checkpoint.id) {
            if fresh {
                self.store.discard(&checkpoint.id);
            }
            return Err(e.into());
        }

        self.prepare(checkpoint)?;

        let artifact_dir = self.store.artifact_dir(&checkpoint.id);
        std::fs::create_dir_all(&artifact_dir).map_err(|source| OrchestratorError::ArtifactDir {
            path: artifact_dir.clone(),
            source,
        })?;

        let status = self.drive(checkpoint, &artifact_dir).await?;

        if let Some(ui) = &self.ui {
            ui.finish(status, checkpoint.halt_reason.as_deref());
        }
        Ok(status)
    }

    /// Bring a checkpoint from any earlier session into a runnable state.
    fn prepare(&self, checkpoint: &mut Checkpoint) -> Result<(), OrchestratorError> {
        checkpoint.ensure_phases(&self.registry);

        for (name, record) in checkpoint.phases.iter_mut() {
            match record.status {
                PhaseStatus::Timeout | PhaseStatus::Failed => {
                    info!(phase = %name, previous = %record.status, "Re-arming phase");
                    record.rearm();
                }
                PhaseStatus::InProgress => {
                    warn!(phase = %name, "Phase was interrupted, re-arming");
                    record.rearm();
                }
                _ => {}
            }
        }

        let demoted = verify_completed(checkpoint);
        if !demoted.is_empty() {
            info!(phases = ?demoted, "Re-running phases with stale artifacts");
        }

        if checkpoint.ensure_nonce()? {
            warn!(run = %checkpoint.id, "Checkpoint had no session nonce, generated a new one");
            checkpoint.warn("Session nonce regenerated on resume");
        }

        if checkpoint.convergence.tier.is_none() {
            let tier = checkpoint.flags.tier.unwrap_or(TierName::Standard);
            checkpoint
                .convergence
                .ensure_tier(checkpoint.config.tiers.tier(tier, "default tier"));
        }

        self.save(checkpoint)?;
        Ok(())
    }

    async fn drive(
        &self,
        checkpoint: &mut Checkpoint,
        artifact_dir: &std::path::Path,
    ) -> Result<TerminalStatus, OrchestratorError> {
        let settings = checkpoint.config.clone();
        let calc = BudgetCalculator::new(&self.registry, &settings);
        let tier = checkpoint
            .convergence
            .tier
            .clone()
            .unwrap_or_else(|| settings.tiers.tier(TierName::Standard, "default tier"));
        let budget = calc.total_budget(&tier);
        let mut clock = PipelineClock::starting_at(Duration::from_millis(checkpoint.elapsed_ms));

        info!(
            run = %checkpoint.id,
            tier = %tier.name,
            budget = %format_duration(budget),
            elapsed = %format_duration(clock.elapsed()),
            "Starting dispatcher"
        );
        if let Some(ui) = &self.ui {
            let done = checkpoint.phases.values().filter(|r| r.status.is_done()).count();
            ui.resume_from(done as u64);
        }

        let phases = self.registry.phases();
        let mut idx = 0;
        while idx < phases.len() {
            let spec = &phases[idx];
            let status = checkpoint.record_mut(&spec.name)?.status;

            if !status.is_done() {
                if clock.exceeded(budget) {
                    let reason = format!(
                        "Run budget of {} exceeded before phase {}",
                        format_duration(budget),
                        spec.name
                    );
                    return self.halt(checkpoint, TerminalStatus::Timeout, reason);
                }
                debug!(
                    phase = %spec.name,
                    remaining = %format_duration(clock.remaining(budget)),
                    "Budget check passed"
                );

                if let Next::Halt(status) =
                    self.step(checkpoint, spec, artifact_dir, &calc, &mut clock).await?
                {
                    return Ok(status);
                }
            }

            if let Some(restart) = self.converge(checkpoint, spec)? {
                idx = restart;
                continue;
            }
            idx += 1;
        }

        // The last phase can only be measured after it ran; its work is kept.
        if clock.exceeded(budget) {
            let message = format!(
                "Run budget of {} exceeded during the final phases ({} spent)",
                format_duration(budget),
                format_duration(clock.elapsed())
            );
            warn!(run = %checkpoint.id, "{}", message);
            if let Some(ui) = &self.ui {
                ui.warning(&message);
            }
            checkpoint.warn(message);
        }

        checkpoint.finish(TerminalStatus::Completed, None);
        self.save(checkpoint)?;
        info!(run = %checkpoint.id, elapsed = %format_duration(clock.elapsed()), "Run completed");
        Ok(TerminalStatus::Completed)
    }

    /// Run one pending phase.
    async fn step(
        &self,
        checkpoint: &mut Checkpoint,
        spec: &PhaseSpec,
        artifact_dir: &std::path::Path,
        calc: &BudgetCalculator<'_>,
        clock: &mut PipelineClock,
    ) -> Result<Next, OrchestratorError> {
        let name = spec.name.as_str();

        if checkpoint.flags.disables(spec.toggle) {
            return self.skip(checkpoint, spec, "disabled by flag");
        }

        if !self.invoker.supports(name) && spec.class != PhaseClass::HardGate {
            return self.skip(checkpoint, spec, "no executor configured");
        }

        if checkpoint.flags.approve && spec.requires_approval {
            match self.approver.approve(spec)? {
                GateDecision::Approved => {}
                GateDecision::Rejected if spec.class != PhaseClass::HardGate => {
                    return self.skip(checkpoint, spec, "rejected by operator");
                }
                GateDecision::Rejected => {
                    let record = checkpoint.record_mut(name)?;
                    record.start(name, None)?;
                    record.fail(name, "rejected by operator", Duration::ZERO)?;
                    return self.apply_failure(checkpoint, spec, "rejected by operator".into(), false);
                }
                GateDecision::Aborted => {
                    let reason = format!("Aborted by operator before phase {}", name);
                    return self.halt(checkpoint, TerminalStatus::Failed, reason).map(Next::Halt);
                }
            }
        }

        let report = self.guard.pre_cleanup(checkpoint).await;
        if let Some(ui) = &self.ui {
            ui.cleanup(report.reclaimed.len());
        }

        // Hard gates without an executor still go through in_progress so the failure is recorded.
        let mut setup_error =
            (!self.invoker.supports(name)).then(|| "no executor configured".to_string());
        let resource = if spec.delegated && setup_error.is_none() {
            match self.lease(checkpoint, spec) {
                Ok(r) => Some(r),
                Err(e) => {
                    setup_error = Some(e);
                    None
                }
            }
        } else {
            None
        };

        let timeout = calc.timeout_for(name)?;
        let artifact_path = artifact_dir.join(&spec.output);
        if let Err(e) = std::fs::remove_file(&artifact_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(phase = %name, "Failed to remove stale artifact: {}", e);
        }

        let invocation = PhaseInvocation {
            run_id: checkpoint.id.clone(),
            phase: name.to_string(),
            artifact_path: artifact_path.clone(),
            inputs: self.input_artifacts(checkpoint, spec),
            resource: resource.clone(),
            timeout,
            draft: checkpoint.flags.draft,
        };

        checkpoint.record_mut(name)?.start(name, resource.as_ref())?;
        self.save(checkpoint)?;
        info!(phase = %name, class = %spec.class, timeout = %format_duration(timeout), "Phase started");
        if let Some(ui) = &self.ui {
            ui.start_phase(name, spec.class, timeout);
        }

        let started = tokio::time::Instant::now();
        let outcome = match setup_error {
            Some(reason) => PhaseOutcome::failed(reason),
            None => match tokio::time::timeout(timeout, self.invoker.invoke(&invocation)).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => PhaseOutcome::failed(format!("{:#}", e)),
                Err(_) => PhaseOutcome::timed_out(),
            },
        };
        let elapsed = started.elapsed();
        clock.add(elapsed);
        checkpoint.elapsed_ms = clock.elapsed().as_millis() as u64;

        if let Some(resource) = &resource {
            let report = self.guard.post_cleanup(resource).await;
            if !report.failed.is_empty() {
                checkpoint.warn(format!("Resource {} could not be released", resource));
            }
        }

        self.record_outcome(checkpoint, spec, outcome, artifact_path, elapsed)
    }

    fn lease(&self, checkpoint: &Checkpoint, spec: &PhaseSpec) -> Result<ResourceName, String> {
        let name = ResourceName::for_phase(&spec.name, checkpoint.id.as_str())
            .map_err(|e| e.to_string())?;
        self.guard
            .backend()
            .lease(&name, checkpoint.id.as_str(), &spec.name)
            .map_err(|e| format!("failed to lease resource: {}", e))?;
        debug!(phase = %spec.name, resource = %name, "Resource leased");
        Ok(name)
    }

    fn input_artifacts(&self, checkpoint: &Checkpoint, spec: &PhaseSpec) -> Vec<PathBuf> {
        spec.inputs
            .iter()
            .filter_map(|input| checkpoint.record(input))
            .filter(|r| r.status == PhaseStatus::Completed)
            .filter_map(|r| r.artifact_path.clone())
            .collect()
    }

    fn record_outcome(
        &self,
        checkpoint: &mut Checkpoint,
        spec: &PhaseSpec,
        outcome: PhaseOutcome,
        artifact_path: PathBuf,
        elapsed: Duration,
    ) -> Result<Next, OrchestratorError> {
        let name = spec.name.as_str();
        let record = checkpoint.record_mut(name)?;

        let (failure, timed_out) = match outcome.status {
            OutcomeStatus::Succeeded => {
                let path = outcome.artifact_path.unwrap_or(artifact_path);
                match hash_file(&path) {
                    Ok(hash) => {
                        record.complete(name, path, hash, elapsed, outcome.findings)?;
                        (None, false)
                    }
                    Err(e) => {
                        let reason = format!("artifact {} not readable: {}", path.display(), e);
                        record.fail(name, &reason, elapsed)?;
                        (Some(reason), false)
                    }
                }
            }
            OutcomeStatus::Failed(reason) => {
                record.fail(name, &reason, elapsed)?;
                (Some(reason), false)
            }
            OutcomeStatus::TimedOut => {
                record.time_out(name, elapsed)?;
                (Some(format!("timed out after {}", format_duration(elapsed))), true)
            }
        };
        let status = record.status;
        let findings = record.findings;
        self.save(checkpoint)?;

        info!(phase = %name, %status, elapsed = %format_duration(elapsed), "Phase finished");
        if let Some(ui) = &self.ui {
            let detail = match (&failure, findings) {
                (Some(reason), _) => Some(reason.clone()),
                (None, Some(n)) => Some(format!("{} finding(s)", n)),
                (None, None) => None,
            };
            ui.phase_finished(name, status, elapsed, detail.as_deref());
        }

        match failure {
            None => Ok(Next::Advance),
            Some(reason) => self.apply_failure(checkpoint, spec, reason, timed_out),
        }
    }

    /// Halt on hard-gate failures, annotate and continue otherwise.
    fn apply_failure(
        &self,
        checkpoint: &mut Checkpoint,
        spec: &PhaseSpec,
        reason: String,
        timed_out: bool,
    ) -> Result<Next, OrchestratorError> {
        if spec.class == PhaseClass::HardGate {
            let status = if timed_out {
                TerminalStatus::Timeout
            } else {
                TerminalStatus::Failed
            };
            let halt = format!("Phase {} ({}) failed: {}", spec.name, spec.class, reason);
            return self.halt(checkpoint, status, halt).map(Next::Halt);
        }

        let message = format!("Phase {} ({}) failed: {}; continuing", spec.name, spec.class, reason);
        warn!("{}", message);
        if let Some(ui) = &self.ui {
            ui.warning(&message);
        }
        checkpoint.warn(message);
        self.save(checkpoint)?;
        Ok(Next::Advance)
    }

    fn skip(&self, checkpoint: &mut Checkpoint, spec: &PhaseSpec, reason: &str) -> Result<Next, OrchestratorError> {
        checkpoint.record_mut(&spec.name)?.skip(&spec.name, reason)?;
        self.save(checkpoint)?;
        info!(phase = %spec.name, reason, "Phase skipped");
        if let Some(ui) = &self.ui {
            ui.phase_skipped(&spec.name, reason);
        }
        Ok(Next::Advance)
    }

    /// After the last phase of the convergence range, decide whether to loop back.
    ///
    /// Returns the index to restart from on retry.
    fn converge(&self, checkpoint: &mut Checkpoint, spec: &PhaseSpec) -> Result<Option<usize>, OrchestratorError> {
        if !self.registry.closes_convergence_cycle(&spec.name) {
            return Ok(None);
        }
        let Some((start, _)) = self.registry.convergence_bounds() else {
            return Ok(None);
        };
        let range = self.registry.convergence_range();
        let (Some(first), Some(last)) = (range.first(), range.last()) else {
            return Ok(None);
        };

        let Some(closing) = checkpoint.record(&last.name) else {
            return Ok(None);
        };
        if closing.status != PhaseStatus::Completed || checkpoint.convergence.current_round_evaluated() {
            return Ok(None);
        }
        let reported = closing.findings;
        let first_review = checkpoint
            .record(&first.name)
            .and_then(|r| r.findings)
            .or(reported)
            .unwrap_or(0);
        let before = checkpoint.convergence.baseline(first_review);

        let round = checkpoint.convergence.round;
        let verdict = match reported {
            Some(after) => checkpoint
                .convergence
                .advance(before, after, checkpoint.config.finding_threshold),
            None => checkpoint.convergence.halt_unreported(before),
        };
        info!(round, before, after = ?reported, %verdict, "Convergence evaluated");

        if let Some(ui) = &self.ui {
            ui.convergence(round, checkpoint.convergence.max_rounds, verdict, start as u64);
        }

        let restart = match verdict {
            Verdict::Converged => None,
            Verdict::Retry => {
                for phase in range {
                    checkpoint.record_mut(&phase.name)?.rearm();
                }
                Some(start)
            }
            Verdict::Halted(_) => {
                let message = match reported {
                    Some(after) => format!(
                        "Convergence {} at round {} with {} finding(s) remaining",
                        verdict, round, after
                    ),
                    None => format!(
                        "Convergence {} at round {}: {} reported no finding count",
                        verdict, round, last.name
                    ),
                };
                warn!("{}", message);
                checkpoint.warn(message);
                None
            }
        };
        self.save(checkpoint)?;
        Ok(restart)
    }

    fn halt(
        &self,
        checkpoint: &mut Checkpoint,
        status: TerminalStatus,
        reason: String,
    ) -> Result<TerminalStatus, OrchestratorError> {
        warn!(run = %checkpoint.id, %status, "{}", reason);
        checkpoint.finish(status, Some(reason));
        self.save(checkpoint)?;
        Ok(status)
    }

    fn save(&self, checkpoint: &mut Checkpoint) -> Result<(), OrchestratorError> {
        checkpoint.touch();
        self.store.save(checkpoint)?;
        Ok(())
    }
}

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::arc_config::{ResolvedSettings, RunFlags};
use crate::convergence::ConvergenceState;
use crate::errors::{CheckpointError, PhaseError};
use crate::phase::PhaseRegistry;
use crate::resource::ResourceName;

pub const CURRENT_SCHEMA_VERSION: u32 = 5;

/// Identifier of a run. Always a valid resource name, since it appears in paths.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        Self(format!("arc-{}", Utc::now().timestamp_millis()))
    }

    pub fn parse(raw: &str) -> Result<Self, CheckpointError> {
        ResourceName::parse(raw).map_err(|e| CheckpointError::InvalidRunId {
            id: raw.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RunId {
    type Error = CheckpointError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Timeout,
}

impl PhaseStatus {
    /// Completed or skipped phases are passed over by the dispatcher.
    pub fn is_done(self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Skipped)
    }

    fn can_become(self, to: PhaseStatus) -> bool {
        use PhaseStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, Skipped)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Timeout)
        )
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
            PhaseStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// One phase's entry in a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub status: PhaseStatus,
    #[serde(default)]
    pub artifact_path: Option<PathBuf>,
    /// SHA-256 hex of the artifact at completion time
    #[serde(default)]
    pub artifact_hash: Option<String>,
    /// Raw name as persisted; validated again before any use
    #[serde(default)]
    pub resource_name: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub findings: Option<u32>,
    #[serde(default)]
    pub attempts: u32,
}

impl Default for PhaseRecord {
    fn default() -> Self {
        Self::pending()
    }
}

impl PhaseRecord {
    pub fn pending() -> Self {
        Self {
            status: PhaseStatus::Pending,
            artifact_path: None,
            artifact_hash: None,
            resource_name: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error: None,
            findings: None,
            attempts: 0,
        }
    }

    fn transition(&mut self, phase: &str, to: PhaseStatus) -> Result<(), PhaseError> {
        if !self.status.can_become(to) {
            return Err(PhaseError::InvalidTransition {
                phase: phase.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn start(&mut self, phase: &str, resource: Option<&ResourceName>) -> Result<(), PhaseError> {
        self.transition(phase, PhaseStatus::InProgress)?;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.duration_ms = None;
        self.artifact_path = None;
        self.artifact_hash = None;
        self.error = None;
        self.findings = None;
        self.resource_name = resource.map(|r| r.to_string());
        self.attempts += 1;
        Ok(())
    }

    pub fn complete(
        &mut self,
        phase: &str,
        artifact_path: PathBuf,
        artifact_hash: String,
        elapsed: Duration,
        findings: Option<u32>,
    ) -> Result<(), PhaseError> {
        self.transition(phase, PhaseStatus::Completed)?;
        self.artifact_path = Some(artifact_path);
        self.artifact_hash = Some(artifact_hash);
        self.findings = findings;
        self.finish(elapsed);
        Ok(())
    }

    pub fn fail(&mut self, phase: &str, reason: &str, elapsed: Duration) -> Result<(), PhaseError> {
        self.transition(phase, PhaseStatus::Failed)?;
        self.error = Some(reason.to_string());
        self.finish(elapsed);
        Ok(())
    }

    pub fn time_out(&mut self, phase: &str, elapsed: Duration) -> Result<(), PhaseError> {
        self.transition(phase, PhaseStatus::Timeout)?;
        self.error = Some(format!("timed out after {}s", elapsed.as_secs()));
        self.finish(elapsed);
        Ok(())
    }

    pub fn skip(&mut self, phase: &str, reason: &str) -> Result<(), PhaseError> {
        self.transition(phase, PhaseStatus::Skipped)?;
        self.error = Some(reason.to_string());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Send the record back to `pending`. Attempts and the resource name are kept.
    pub fn rearm(&mut self) {
        self.status = PhaseStatus::Pending;
        self.error = None;
        self.artifact_path = None;
        self.artifact_hash = None;
        self.completed_at = None;
        self.duration_ms = None;
        self.findings = None;
    }

    fn finish(&mut self, elapsed: Duration) {
        self.completed_at = Some(Utc::now());
        self.duration_ms = Some(elapsed.as_millis() as u64);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    InProgress,
    Completed,
    Failed,
    Timeout,
}

impl RunStatus {
    pub fn terminal(self) -> Option<TerminalStatus> {
        match self {
            RunStatus::InProgress => None,
            RunStatus::Completed => Some(TerminalStatus::Completed),
            RunStatus::Failed => Some(TerminalStatus::Failed),
            RunStatus::Timeout => Some(TerminalStatus::Timeout),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.terminal() {
            Some(t) => fmt::Display::fmt(&t, f),
            None => f.write_str("in_progress"),
        }
    }
}

/// Final outcome of a dispatcher run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Completed,
    Failed,
    Timeout,
}

impl TerminalStatus {
    pub fn exit_code(self) -> u8 {
        match self {
            TerminalStatus::Completed => 0,
            TerminalStatus::Failed => 1,
            TerminalStatus::Timeout => 2,
        }
    }
}

impl From<TerminalStatus> for RunStatus {
    fn from(t: TerminalStatus) -> Self {
        match t {
            TerminalStatus::Completed => RunStatus::Completed,
            TerminalStatus::Failed => RunStatus::Failed,
            TerminalStatus::Timeout => RunStatus::Timeout,
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminalStatus::Completed => "completed",
            TerminalStatus::Failed => "failed",
            TerminalStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Persisted progress of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: RunId,
    pub schema_version: u32,
    pub plan_reference: String,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub flags: RunFlags,
    #[serde(default)]
    pub config: ResolvedSettings,
    pub phases: BTreeMap<String, PhaseRecord>,
    #[serde(default)]
    pub convergence: ConvergenceState,
    /// 32 lowercase hex characters; empty only for migrated documents
    #[serde(default)]
    pub session_nonce: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Time spent inside phases across every session of this run
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default)]
    pub halt_reason: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl Checkpoint {
    pub fn new(
        id: RunId,
        plan_reference: &str,
        registry: &PhaseRegistry,
        flags: RunFlags,
        config: ResolvedSettings,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            schema_version: CURRENT_SCHEMA_VERSION,
            plan_reference: plan_reference.to_string(),
            status: RunStatus::InProgress,
            flags,
            config,
            phases: registry
                .names()
                .into_iter()
                .map(|n| (n.to_string(), PhaseRecord::pending()))
                .collect(),
            convergence: ConvergenceState::default(),
            session_nonce: generate_nonce(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            elapsed_ms: 0,
            halt_reason: None,
            warnings: Vec::new(),
        }
    }

    pub fn record(&self, phase: &str) -> Option<&PhaseRecord> {
        self.phases.get(phase)
    }

    pub fn record_mut(&mut self, phase: &str) -> Result<&mut PhaseRecord, PhaseError> {
        self.phases
            .get_mut(phase)
            .ok_or_else(|| PhaseError::UnknownPhase(phase.to_string()))
    }

    /// Add a pending record for any registry phase the checkpoint lacks.
    pub fn ensure_phases(&mut self, registry: &PhaseRegistry) {
        for name in registry.names() {
            self.phases.entry(name.to_string()).or_default();
        }
    }

    /// Validate the session nonce, regenerating it when empty.
    ///
    /// Returns `true` when a new nonce was generated.
    pub fn ensure_nonce(&mut self) -> Result<bool, CheckpointError> {
        if self.session_nonce.is_empty() {
            self.session_nonce = generate_nonce();
            return Ok(true);
        }
        if !is_valid_nonce(&self.session_nonce) {
            return Err(CheckpointError::NonceInvalid {
                id: self.id.to_string(),
                nonce: self.session_nonce.clone(),
            });
        }
        Ok(false)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn finish(&mut self, status: TerminalStatus, halt_reason: Option<String>) {
        self.status = status.into();
        self.halt_reason = halt_reason;
        if status == TerminalStatus::Completed {
            self.completed_at = Some(Utc::now());
        }
    }

    /// Reopen a failed or timed-out run for resumption.
    ///
    /// A timed-out run gets a fresh budget window.
    pub fn reopen(&mut self) {
        if self.status == RunStatus::Timeout {
            self.elapsed_ms = 0;
        }
        if matches!(self.status, RunStatus::Failed | RunStatus::Timeout) {
            self.status = RunStatus::InProgress;
            self.halt_reason = None;
        }
    }

    /// Whether the run is in progress and was touched within `max_idle`.
    pub fn is_live(&self, now: DateTime<Utc>, max_idle: Duration) -> bool {
        let max_idle = ChronoDuration::from_std(max_idle).unwrap_or(ChronoDuration::MAX);
        self.status == RunStatus::InProgress && now - self.updated_at <= max_idle
    }

    /// Raw resource names recorded by any phase.
    pub fn resource_names(&self) -> BTreeSet<String> {
        self.phases
            .values()
            .filter_map(|r| r.resource_name.clone())
            .collect()
    }

    pub fn count(&self, status: PhaseStatus) -> usize {
        self.phases.values().filter(|r| r.status == status).count()
    }
}

/// A fresh random session nonce.
pub fn generate_nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn is_valid_nonce(nonce: &str) -> bool {
    nonce.len() == 32
        && nonce
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

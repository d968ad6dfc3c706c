//! Phase invocation.
//!
//! The dispatcher never knows what a phase does. It hands a [`PhaseInvocation`]
//! to a [`PhaseInvoker`] and gets back a [`PhaseOutcome`]. [`CommandInvoker`]
//! runs the shell command configured for the phase in `arc.toml`.
//!
//! Commands see the invocation through environment variables:
//! - `ARC_RUN_ID`, `ARC_PHASE`
//! - `ARC_ARTIFACT`: where the phase must write its artifact
//! - `ARC_INPUTS`: artifacts of the phase's inputs, separated by `:`
//! - `ARC_RESOURCE`: leased resource name (empty for orchestrator-only phases)
//! - `ARC_DRAFT`: `1` in draft mode
//!
//! A command may report review findings with `<findings>N</findings>` on stdout.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::checkpoint::RunId;
use crate::resource::ResourceName;

static FINDINGS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<findings>\s*(\d+)\s*</findings>").unwrap());

/// Everything a phase needs to run.
#[derive(Debug, Clone)]
pub struct PhaseInvocation {
    pub run_id: RunId,
    pub phase: String,
    pub artifact_path: PathBuf,
    /// Artifacts of completed input phases
    pub inputs: Vec<PathBuf>,
    pub resource: Option<ResourceName>,
    pub timeout: Duration,
    pub draft: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    Succeeded,
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub status: OutcomeStatus,
    /// Artifact actually written, if different from the requested path
    pub artifact_path: Option<PathBuf>,
    /// Review findings reported by the phase
    pub findings: Option<u32>,
}

impl PhaseOutcome {
    pub fn succeeded() -> Self {
        Self {
            status: OutcomeStatus::Succeeded,
            artifact_path: None,
            findings: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed(reason.into()),
            artifact_path: None,
            findings: None,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            status: OutcomeStatus::TimedOut,
            artifact_path: None,
            findings: None,
        }
    }

    pub fn with_findings(mut self, findings: u32) -> Self {
        self.findings = Some(findings);
        self
    }
}

/// Executes phases on behalf of the dispatcher.
#[async_trait]
pub trait PhaseInvoker: Send + Sync {
    /// Whether this invoker has something to run for `phase`.
    fn supports(&self, _phase: &str) -> bool {
        true
    }

    async fn invoke(&self, invocation: &PhaseInvocation) -> Result<PhaseOutcome>;
}

/// Extract the last `<findings>N</findings>` tag from text.
pub fn parse_findings(text: &str) -> Option<u32> {
    FINDINGS_REGEX
        .captures_iter(text)
        .filter_map(|cap| cap.get(1)?.as_str().parse().ok())
        .last()
}

/// Runs the shell command configured for each phase.
pub struct CommandInvoker {
    commands: BTreeMap<String, String>,
    working_dir: PathBuf,
}

impl CommandInvoker {
    pub fn new(commands: BTreeMap<String, String>, working_dir: &Path) -> Self {
        Self {
            commands,
            working_dir: working_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl PhaseInvoker for CommandInvoker {
    fn supports(&self, phase: &str) -> bool {
        self.commands.contains_key(phase)
    }

    async fn invoke(&self, invocation: &PhaseInvocation) -> Result<PhaseOutcome> {
        let Some(command) = self.commands.get(&invocation.phase) else {
            return Ok(PhaseOutcome::failed(format!(
                "No command configured for phase {}",
                invocation.phase
            )));
        };

        let inputs = invocation
            .inputs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");

        debug!(phase = %invocation.phase, %command, "Spawning phase command");

        // Dropping the future (dispatcher timeout) kills the child.
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("ARC_RUN_ID", invocation.run_id.as_str())
            .env("ARC_PHASE", &invocation.phase)
            .env("ARC_ARTIFACT", &invocation.artifact_path)
            .env("ARC_INPUTS", inputs)
            .env(
                "ARC_RESOURCE",
                invocation
                    .resource
                    .as_ref()
                    .map(|r| r.as_str())
                    .unwrap_or(""),
            )
            .env("ARC_DRAFT", if invocation.draft { "1" } else { "0" })
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn command for phase {}", invocation.phase))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let detail = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("")
                .trim();
            let reason = if detail.is_empty() {
                format!("exit code {}", code)
            } else {
                format!("exit code {}: {}", code, detail)
            };
            return Ok(PhaseOutcome::failed(reason));
        }

        // Commands that only print are given their stdout as the artifact.
        if !invocation.artifact_path.exists() {
            tokio::fs::write(&invocation.artifact_path, stdout.as_bytes())
                .await
                .with_context(|| {
                    format!(
                        "Failed to write artifact {}",
                        invocation.artifact_path.display()
                    )
                })?;
        }

        Ok(PhaseOutcome {
            status: OutcomeStatus::Succeeded,
            artifact_path: None,
            findings: parse_findings(&stdout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn invocation(dir: &Path, phase: &str) -> PhaseInvocation {
        PhaseInvocation {
            run_id: RunId::parse("arc-1").unwrap(),
            phase: phase.to_string(),
            artifact_path: dir.join(format!("{phase}.md")),
            inputs: vec![dir.join("a.md"), dir.join("b.md")],
            resource: Some(ResourceName::parse("arc-work-1").unwrap()),
            timeout: Duration::from_secs(30),
            draft: true,
        }
    }

    #[test]
    fn test_parse_findings() {
        assert_eq!(parse_findings("no tags"), None);
        assert_eq!(parse_findings("<findings>3</findings>"), Some(3));
        assert_eq!(
            parse_findings("<findings> 5 </findings> later <findings>2</findings>"),
            Some(2)
        );
        assert_eq!(parse_findings("<findings>many</findings>"), None);
    }

    #[tokio::test]
    async fn test_command_invoker_exports_environment() {
        let dir = tempdir().unwrap();
        let mut commands = BTreeMap::new();
        commands.insert(
            "work".to_string(),
            r#"printf '%s|%s|%s|%s|%s' "$ARC_RUN_ID" "$ARC_PHASE" "$ARC_RESOURCE" "$ARC_DRAFT" "$ARC_INPUTS" > "$ARC_ARTIFACT""#
                .to_string(),
        );
        let invoker = CommandInvoker::new(commands, dir.path());
        let inv = invocation(dir.path(), "work");

        let outcome = invoker.invoke(&inv).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Succeeded);

        let written = std::fs::read_to_string(&inv.artifact_path).unwrap();
        let expected = format!(
            "arc-1|work|arc-work-1|1|{}:{}",
            dir.path().join("a.md").display(),
            dir.path().join("b.md").display()
        );
        assert_eq!(written, expected);
    }

    #[tokio::test]
    async fn test_command_invoker_captures_stdout_and_findings() {
        let dir = tempdir().unwrap();
        let mut commands = BTreeMap::new();
        commands.insert(
            "code_review".to_string(),
            "echo 'review done <findings>4</findings>'".to_string(),
        );
        let invoker = CommandInvoker::new(commands, dir.path());
        let inv = invocation(dir.path(), "code_review");

        let outcome = invoker.invoke(&inv).await.unwrap();
        assert_eq!(outcome.findings, Some(4));
        assert!(
            std::fs::read_to_string(&inv.artifact_path)
                .unwrap()
                .contains("review done")
        );
    }

    #[tokio::test]
    async fn test_command_invoker_reports_failure() {
        let dir = tempdir().unwrap();
        let mut commands = BTreeMap::new();
        commands.insert("work".to_string(), "echo broken >&2; exit 3".to_string());
        let invoker = CommandInvoker::new(commands, dir.path());

        let outcome = invoker.invoke(&invocation(dir.path(), "work")).await.unwrap();
        assert_eq!(
            outcome.status,
            OutcomeStatus::Failed("exit code 3: broken".to_string())
        );
    }

    #[test]
    fn test_supports_only_configured_phases() {
        let mut commands = BTreeMap::new();
        commands.insert("work".to_string(), "true".to_string());
        let invoker = CommandInvoker::new(commands, Path::new("."));
        assert!(invoker.supports("work"));
        assert!(!invoker.supports("ship"));
    }
}

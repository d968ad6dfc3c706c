//! Pipeline execution: `arc run <plan>` and `arc resume`.

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use arc_pipeline::arc_config::RunFlags;
use arc_pipeline::checkpoint::{Checkpoint, CheckpointStore, RunId, TerminalStatus};
use arc_pipeline::config::Config;
use arc_pipeline::convergence::{ChangeProfile, ConvergenceTier, TierName, TierSelector, TierTable};
use arc_pipeline::errors::CheckpointError;
use arc_pipeline::gates::ApprovalGate;
use arc_pipeline::orchestrator::{CommandInvoker, Dispatcher};
use arc_pipeline::phase::PhaseRegistry;
use arc_pipeline::resource::{CleanupGuard, FsResourceBackend};
use arc_pipeline::ui::PipelineUI;

use super::super::{Cli, RunArgs};

/// Pick the convergence tier for a new run.
///
/// An explicit tier wins; without any change profile the run is `standard`.
fn select_tier(table: &TierTable, tier: Option<TierName>, args: &RunArgs) -> ConvergenceTier {
    let selector = TierSelector::new(table.clone());
    if let Some(name) = tier {
        return selector.explicit(name);
    }
    if args.files.is_none() && args.lines.is_none() && args.risk.is_none() {
        return table.tier(TierName::Standard, "no change profile given");
    }
    selector.select(&ChangeProfile {
        files_changed: args.files.unwrap_or(0),
        lines_changed: args.lines.unwrap_or(0),
        risk: args.risk.unwrap_or_default(),
    })
}

fn build_dispatcher(cli: &Cli, config: &Config, registry: PhaseRegistry) -> Dispatcher {
    let store = CheckpointStore::new(config.runs_dir.clone(), &registry);
    let backend = Arc::new(FsResourceBackend::new(&config.resource_root));
    let guard = CleanupGuard::new(backend, config.toml.cleanup.policy());
    let invoker = Arc::new(CommandInvoker::new(config.toml.commands(), &config.project_dir));
    let ui = Arc::new(PipelineUI::new(registry.len() as u64, cli.verbose));

    Dispatcher::new(registry, store, guard, invoker)
        .with_approver(Arc::new(ApprovalGate::new(cli.yes)))
        .with_ui(ui)
}

fn load_config(cli: &Cli, project_dir: &Path) -> Result<Config> {
    let config = Config::new(project_dir.to_path_buf(), cli.verbose)?;
    config.ensure_directories()?;

    let registry = PhaseRegistry::default_arc();
    for warning in config.toml.validate(&registry) {
        eprintln!("  {} {}", console::style("warning:").yellow(), warning);
    }
    Ok(config)
}

fn print_summary(checkpoint: &Checkpoint, status: TerminalStatus) {
    println!();
    let label = match status {
        TerminalStatus::Completed => console::style(status.to_string()).green().bold(),
        _ => console::style(status.to_string()).red().bold(),
    };
    println!("Run {} {}", console::style(&checkpoint.id).bold(), label);
    if let Some(reason) = &checkpoint.halt_reason {
        println!("  Reason: {}", reason);
    }
    for warning in &checkpoint.warnings {
        println!("  Warning: {}", warning);
    }
    if status != TerminalStatus::Completed {
        println!();
        println!("Run `arc resume --run {}` to continue.", checkpoint.id);
    }
}

pub async fn cmd_run(cli: &Cli, project_dir: &Path, args: &RunArgs) -> Result<ExitCode> {
    let config = load_config(cli, project_dir)?;
    let registry = PhaseRegistry::default_arc();

    let cli_flags = RunFlags {
        no_forge: args.no_forge,
        no_test: args.no_test,
        no_ship: args.no_ship,
        approve: args.approve,
        draft: args.draft,
        tier: args.tier,
    };
    let flags = config.toml.merge_flags(&cli_flags);
    let settings = config.toml.resolve();
    let tier = select_tier(&settings.tiers, flags.tier, args);

    let mut checkpoint = Checkpoint::new(RunId::generate(), &args.plan, &registry, flags, settings);
    println!(
        "Starting run {} ({} tier: {})",
        console::style(&checkpoint.id).bold(),
        tier.name,
        tier.justification
    );
    checkpoint.convergence.ensure_tier(tier);

    let dispatcher = build_dispatcher(cli, &config, registry);
    let status = dispatcher
        .run(&mut checkpoint)
        .await
        .with_context(|| format!("Run {} stopped", checkpoint.id))?;

    print_summary(&checkpoint, status);
    Ok(ExitCode::from(status.exit_code()))
}

pub async fn cmd_resume(cli: &Cli, project_dir: &Path, run: Option<&str>) -> Result<ExitCode> {
    let config = load_config(cli, project_dir)?;
    let registry = PhaseRegistry::default_arc();
    let store = CheckpointStore::new(config.runs_dir.clone(), &registry);

    let loaded = match run {
        Some(raw) => store.load(&RunId::parse(raw)?).map(Some),
        None => store.latest(),
    };
    let mut checkpoint = match loaded {
        Ok(Some(cp)) => cp,
        Ok(None) => bail!("No checkpoint to resume. Run `arc run <plan>` first."),
        Err(e @ CheckpointError::Corrupt { .. }) => {
            return Err(e)
                .context("Checkpoint cannot be resumed; fix it by hand or start a fresh run");
        }
        Err(e) => return Err(e.into()),
    };

    println!(
        "Resuming run {} ({}, {} of {} phases done)",
        console::style(&checkpoint.id).bold(),
        checkpoint.status,
        checkpoint.phases.values().filter(|r| r.status.is_done()).count(),
        checkpoint.phases.len()
    );

    let dispatcher = build_dispatcher(cli, &config, registry);
    let status = dispatcher
        .resume(&mut checkpoint)
        .await
        .with_context(|| format!("Run {} stopped", checkpoint.id))?;

    print_summary(&checkpoint, status);
    Ok(ExitCode::from(status.exit_code()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arc_pipeline::convergence::Risk;

    fn args() -> RunArgs {
        RunArgs {
            plan: "plans/feature.md".into(),
            no_forge: false,
            no_test: false,
            no_ship: false,
            approve: false,
            draft: false,
            tier: None,
            risk: None,
            files: None,
            lines: None,
        }
    }

    #[test]
    fn test_select_tier_defaults_to_standard() {
        let tier = select_tier(&TierTable::default(), None, &args());
        assert_eq!(tier.name, TierName::Standard);
    }

    #[test]
    fn test_select_tier_explicit_wins() {
        let mut a = args();
        a.risk = Some(Risk::High);
        let tier = select_tier(&TierTable::default(), Some(TierName::Light), &a);
        assert_eq!(tier.name, TierName::Light);
    }

    #[test]
    fn test_select_tier_classifies_profile() {
        let mut a = args();
        a.files = Some(1);
        a.lines = Some(20);
        assert_eq!(select_tier(&TierTable::default(), None, &a).name, TierName::Light);

        a.risk = Some(Risk::High);
        assert_eq!(select_tier(&TierTable::default(), None, &a).name, TierName::Thorough);
    }
}

//! Run inspection: `arc status` and `arc list`.

use anyhow::{Context, Result};
use console::{StyledObject, style};
use std::path::Path;
use std::time::Duration;

use arc_pipeline::budget::format_duration;
use arc_pipeline::checkpoint::{Checkpoint, CheckpointStore, PhaseStatus, RunId, RunStatus};
use arc_pipeline::init::{get_arc_dir, is_initialized};
use arc_pipeline::phase::PhaseRegistry;

fn store_for(project_dir: &Path, registry: &PhaseRegistry) -> CheckpointStore {
    CheckpointStore::new(get_arc_dir(project_dir).join("runs"), registry)
}

fn styled_status(status: PhaseStatus) -> StyledObject<String> {
    let label = style(status.to_string());
    match status {
        PhaseStatus::Completed => label.green(),
        PhaseStatus::Failed | PhaseStatus::Timeout => label.red(),
        PhaseStatus::InProgress => label.yellow(),
        PhaseStatus::Pending | PhaseStatus::Skipped => label.dim(),
    }
}

fn styled_run_status(status: RunStatus) -> StyledObject<String> {
    let label = style(status.to_string()).bold();
    match status {
        RunStatus::Completed => label.green(),
        RunStatus::InProgress => label.yellow(),
        RunStatus::Failed | RunStatus::Timeout => label.red(),
    }
}

pub fn cmd_status(project_dir: &Path, run: Option<&str>) -> Result<()> {
    if !is_initialized(project_dir) {
        println!();
        println!("No arc workspace found. Run 'arc init' first.");
        println!();
        return Ok(());
    }

    let registry = PhaseRegistry::default_arc();
    let store = store_for(project_dir, &registry);
    let checkpoint = match run {
        Some(raw) => store.load(&RunId::parse(raw)?)?,
        None => match store
            .latest()
            .context("Newest checkpoint is unreadable; see `arc list`")?
        {
            Some(cp) => cp,
            None => {
                println!();
                println!("No runs yet. Run 'arc run <plan>' to start one.");
                println!();
                return Ok(());
            }
        },
    };

    print_checkpoint(&checkpoint, &registry);
    Ok(())
}

fn print_checkpoint(checkpoint: &Checkpoint, registry: &PhaseRegistry) {
    println!();
    println!("Run {}", style(&checkpoint.id).bold());
    println!("  Plan:     {}", checkpoint.plan_reference);
    println!("  Status:   {}", styled_run_status(checkpoint.status));
    println!(
        "  Started:  {}",
        checkpoint.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "  Elapsed:  {}",
        format_duration(Duration::from_millis(checkpoint.elapsed_ms))
    );
    println!(
        "  Phases:   {} completed, {} skipped, {} failed, {} timed out",
        checkpoint.count(PhaseStatus::Completed),
        checkpoint.count(PhaseStatus::Skipped),
        checkpoint.count(PhaseStatus::Failed),
        checkpoint.count(PhaseStatus::Timeout)
    );
    if let Some(tier) = &checkpoint.convergence.tier {
        let convergence = &checkpoint.convergence;
        let verdict = match convergence.history.last() {
            Some(last) if convergence.is_settled() => format!(", {}", last.verdict),
            _ => String::new(),
        };
        println!(
            "  Tier:     {} (round {} of {}{})",
            tier.name, convergence.round, tier.max_cycles, verdict
        );
    }
    if let Some(reason) = &checkpoint.halt_reason {
        println!("  Halted:   {}", style(reason).red());
    }
    println!();

    println!(
        "{:<14} {:<12} {:<10} {:<8} Detail",
        "Phase", "Status", "Duration", "Attempts"
    );
    println!(
        "{:<14} {:<12} {:<10} {:<8} ------",
        "-----", "------", "--------", "--------"
    );

    // Registry order first, then anything only the checkpoint knows about.
    let mut names: Vec<&str> = registry.names();
    for name in checkpoint.phases.keys() {
        if registry.get(name).is_none() {
            names.push(name);
        }
    }

    for name in names {
        let Some(record) = checkpoint.record(name) else {
            continue;
        };
        let duration = record
            .duration_ms
            .map(|ms| format_duration(Duration::from_millis(ms)))
            .unwrap_or_else(|| "-".to_string());
        let detail = match (&record.error, record.findings) {
            (Some(err), _) => err.clone(),
            (None, Some(n)) => format!("{} finding(s)", n),
            (None, None) => String::new(),
        };
        println!(
            "{:<14} {:<12} {:<10} {:<8} {}",
            name,
            styled_status(record.status),
            duration,
            record.attempts,
            style(detail).dim()
        );
    }

    if !checkpoint.warnings.is_empty() {
        println!();
        println!("Warnings:");
        for warning in &checkpoint.warnings {
            println!("  - {}", warning);
        }
    }
    println!();
}

pub fn cmd_list(project_dir: &Path) -> Result<()> {
    if !is_initialized(project_dir) {
        println!();
        println!("No arc workspace found. Run 'arc init' first.");
        println!();
        return Ok(());
    }

    let registry = PhaseRegistry::default_arc();
    let listing = store_for(project_dir, &registry).list();

    if listing.checkpoints.is_empty() && listing.corrupt.is_empty() {
        println!();
        println!("No runs yet.");
        println!();
        return Ok(());
    }

    println!();
    println!(
        "{:<20} {:<12} {:<8} {:<20} Plan",
        "Run", "Status", "Done", "Updated"
    );
    println!(
        "{:<20} {:<12} {:<8} {:<20} ----",
        "---", "------", "----", "-------"
    );
    for cp in &listing.checkpoints {
        let done = cp.phases.values().filter(|r| r.status.is_done()).count();
        println!(
            "{:<20} {:<12} {:<8} {:<20} {}",
            cp.id.as_str(),
            cp.status.to_string(),
            format!("{}/{}", done, cp.phases.len()),
            cp.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            cp.plan_reference
        );
    }

    if !listing.corrupt.is_empty() {
        println!();
        println!("{}", style("Unreadable checkpoints:").red());
        for err in &listing.corrupt {
            println!("  - {}", err);
        }
    }
    println!();
    Ok(())
}

//! Orphan resource scan: `arc cleanup`.

use anyhow::Result;
use chrono::Utc;
use console::style;
use std::path::Path;
use std::sync::Arc;

use arc_pipeline::checkpoint::CheckpointStore;
use arc_pipeline::config::Config;
use arc_pipeline::phase::PhaseRegistry;
use arc_pipeline::resource::{CleanupGuard, FsResourceBackend};
use arc_pipeline::ui::icons::{BROOM, CHECK, CROSS, WARN};

use super::super::Cli;

pub async fn cmd_cleanup(cli: &Cli, project_dir: &Path, dry_run: bool) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), cli.verbose)?;
    let registry = PhaseRegistry::default_arc();
    let store = CheckpointStore::new(config.runs_dir.clone(), &registry);

    let policy = config.toml.cleanup.policy();
    let now = Utc::now();
    let active = store.active_resources(now, policy.abandoned_run_age);

    let backend = Arc::new(FsResourceBackend::new(&config.resource_root));
    let guard = CleanupGuard::new(backend, policy);
    let report = guard
        .scan_orphans(&config.toml.cleanup.resource_prefixes, &active, now, dry_run)
        .await;

    println!();
    if dry_run {
        println!("{}Orphan scan (dry run)", BROOM);
    } else {
        println!("{}Orphan scan", BROOM);
    }
    println!();

    for name in &report.would_reclaim {
        println!("  would reclaim {}", style(name).bold());
    }
    for (name, strategy) in &report.reclaimed {
        println!("  {}reclaimed {} {}", CHECK, style(name).bold(), style(format!("({})", strategy)).dim());
    }
    for name in &report.failed {
        println!("  {}could not reclaim {}", CROSS, style(name).red());
    }
    for raw in &report.rejected {
        println!("  {}rejected unsafe name {:?}", WARN, raw);
    }
    if cli.verbose {
        for name in &report.kept_active {
            println!("  kept {} {}", name, style("(active run)").dim());
        }
        for name in &report.kept_fresh {
            println!("  kept {} {}", name, style("(too recent)").dim());
        }
    }

    if report.is_empty() {
        println!("  No orphaned resources found.");
    }
    if !report.pruned.is_empty() {
        println!(
            "  {}",
            style(format!("pruned {} released lease record(s)", report.pruned.len())).dim()
        );
    }
    println!();
    println!(
        "{} reclaimed, {} failed, {} kept",
        report.reclaimed.len(),
        report.failed.len(),
        report.kept_active.len() + report.kept_fresh.len()
    );
    println!();
    Ok(())
}

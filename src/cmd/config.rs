//! Configuration view and validation commands: `arc config`.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;

use arc_pipeline::arc_config::{ArcToml, CONFIG_FILE};
use arc_pipeline::budget::{BudgetCalculator, format_duration};
use arc_pipeline::convergence::TierName;
use arc_pipeline::init::get_arc_dir;
use arc_pipeline::phase::PhaseRegistry;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let arc_dir = get_arc_dir(project_dir);
    let config_path = arc_dir.join(CONFIG_FILE);
    let registry = PhaseRegistry::default_arc();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Arc Configuration");
            println!("=================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                ArcToml::load(&config_path)?
            } else {
                println!("No arc.toml found at {}; using defaults.", config_path.display());
                ArcToml::default()
            };
            let toml = toml.with_env_overrides(|key| std::env::var(key).ok())?;
            println!();
            print!(
                "{}",
                toml::to_string_pretty(&toml).context("Failed to render configuration")?
            );
            println!();

            let settings = toml.resolve();
            let calc = BudgetCalculator::new(&registry, &settings);
            println!("Effective phase timeouts:");
            for spec in registry.phases() {
                let timeout = calc.timeout_for(&spec.name)?;
                let command = toml.command_for(&spec.name).unwrap_or("-");
                println!(
                    "  {:<14} {:>8}  {:<14} {}",
                    spec.name,
                    format_duration(timeout),
                    spec.class.to_string(),
                    command
                );
            }
            println!();
            println!("Run budget by tier:");
            for name in [TierName::Light, TierName::Standard, TierName::Thorough] {
                let tier = settings.tiers.tier(name, "");
                println!(
                    "  {:<10} {} ({}..={} cycles)",
                    name.to_string(),
                    format_duration(calc.total_budget(&tier)),
                    tier.min_cycles,
                    tier.max_cycles
                );
            }
            println!(
                "  hard cap   {}",
                format_duration(Duration::from_millis(settings.hard_cap_ms))
            );
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No arc.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ArcToml::load(&config_path)?;
            let warnings = toml.validate(&registry);

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("arc.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&arc_dir)
                .with_context(|| format!("Failed to create {}", arc_dir.display()))?;
            ArcToml::default().save(&config_path)?;

            println!("Created arc.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [phases.<name>] command for each phase");
            println!("  - [timeouts] per-phase overrides in milliseconds");
            println!("  - [convergence.tiers.<tier>] min_cycles, max_cycles");
            println!("  - [cleanup] orphan thresholds and resource prefixes");
            println!();
        }
    }

    Ok(())
}
